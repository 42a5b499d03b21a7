//! Consumer group coordination.
//!
//! Maps a (stream, tenant) pair onto broker resource names and manages the
//! lifecycle of those groups:
//!
//! - group:    `{baseGroup}:{streamType}:{tenantId}`
//! - consumer: `{app}-{streamType}-{tenantId}-{instanceId}`
//!
//! Read-only inspection calls never fail on a stream or group that does not
//! exist yet; they return empty results so health polling stays quiet.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::broker::{
    BrokerError, ConsumerInfo, GroupInfo, PendingSummary, StreamBroker, StreamInfo,
};
use crate::streams::StreamTable;

/// Idle time after which a consumer identity is considered stale.
pub const DEFAULT_IDLE_CONSUMER_THRESHOLD: Duration = Duration::from_secs(2 * 60 * 60);

/// Naming inputs shared by every group and consumer this process owns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinatorSettings {
    pub base_group: String,
    pub app_name: String,
    pub instance_id: String,
    /// Where new groups start reading; `0` replays the whole stream
    pub start_id: String,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            base_group: "crm-sync".to_string(),
            app_name: "crm-sync".to_string(),
            instance_id: "0".to_string(),
            start_id: "0".to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("failed to create group {group} on {stream}: {source}")]
    CreateGroup {
        stream: String,
        group: String,
        #[source]
        source: BrokerError,
    },

    #[error(transparent)]
    Broker(#[from] BrokerError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupStatus {
    Created,
    Existing,
}

/// Result of creating one group.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupCreation {
    pub stream: String,
    pub group: String,
    pub status: GroupStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupFailure {
    pub stream: String,
    pub group: String,
    pub error: String,
}

/// Aggregate of [`ConsumerGroupCoordinator::create_consumer_groups`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupCreationReport {
    pub created: Vec<GroupCreation>,
    pub existing: Vec<GroupCreation>,
    pub failed: Vec<GroupFailure>,
}

impl GroupCreationReport {
    /// Groups that are usable after this run.
    pub fn ready(&self) -> usize {
        self.created.len() + self.existing.len()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupReport {
    pub removed: Vec<String>,
    /// Idle consumers kept because they still own pending messages
    pub kept_with_pending: Vec<String>,
    pub failed: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamHealth {
    pub stream: String,
    pub group: String,
    pub healthy: bool,
    pub length: u64,
    pub pending: u64,
    pub consumers: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CoordinatorHealth {
    pub status: String,
    pub tenant_id: String,
    pub total_pending: u64,
    pub streams: Vec<StreamHealth>,
}

/// Owns consumer group naming and lifecycle for one process.
pub struct ConsumerGroupCoordinator {
    broker: Arc<dyn StreamBroker>,
    streams: Arc<StreamTable>,
    settings: CoordinatorSettings,
}

impl ConsumerGroupCoordinator {
    pub fn new(
        broker: Arc<dyn StreamBroker>,
        streams: Arc<StreamTable>,
        settings: CoordinatorSettings,
    ) -> Self {
        Self {
            broker,
            streams,
            settings,
        }
    }

    pub fn settings(&self) -> &CoordinatorSettings {
        &self.settings
    }

    pub fn streams(&self) -> &StreamTable {
        &self.streams
    }

    /// `{baseGroup}:{streamType}:{tenantId}`
    pub fn generate_consumer_group_name(&self, stream: &str, tenant_id: &str) -> String {
        format!(
            "{}:{}:{}",
            self.settings.base_group,
            self.streams.stream_type(stream),
            tenant_id
        )
    }

    /// `{app}-{streamType}-{tenantId}-{instanceId}`
    pub fn generate_consumer_name(&self, stream: &str, tenant_id: &str) -> String {
        format!(
            "{}-{}-{}-{}",
            self.settings.app_name,
            self.streams.stream_type(stream),
            tenant_id,
            self.settings.instance_id
        )
    }

    /// Create the group for every stream. One stream failing never stops
    /// the rest.
    pub async fn create_consumer_groups(
        &self,
        streams: &[String],
        tenant_id: &str,
    ) -> GroupCreationReport {
        let mut report = GroupCreationReport::default();

        for stream in streams {
            match self.create_consumer_group(stream, tenant_id).await {
                Ok(creation) => match creation.status {
                    GroupStatus::Created => report.created.push(creation),
                    GroupStatus::Existing => report.existing.push(creation),
                },
                Err(e) => {
                    error!(stream = %stream, error = %e, "Failed to create consumer group");
                    report.failed.push(GroupFailure {
                        stream: stream.clone(),
                        group: self.generate_consumer_group_name(stream, tenant_id),
                        error: e.to_string(),
                    });
                }
            }
        }

        info!(
            tenant_id = %tenant_id,
            created = report.created.len(),
            existing = report.existing.len(),
            failed = report.failed.len(),
            "Consumer groups ready"
        );
        report
    }

    /// XGROUP CREATE ... MKSTREAM. An existing group is a success.
    pub async fn create_consumer_group(
        &self,
        stream: &str,
        tenant_id: &str,
    ) -> Result<GroupCreation, CoordinatorError> {
        let group = self.generate_consumer_group_name(stream, tenant_id);

        let status = match self
            .broker
            .create_group(stream, &group, &self.settings.start_id)
            .await
        {
            Ok(()) => {
                info!(stream = %stream, group = %group, outcome = "success", "Created consumer group");
                GroupStatus::Created
            }
            Err(BrokerError::GroupExists(_)) => {
                debug!(stream = %stream, group = %group, "Consumer group already exists");
                GroupStatus::Existing
            }
            Err(source) => {
                return Err(CoordinatorError::CreateGroup {
                    stream: stream.to_string(),
                    group,
                    source,
                })
            }
        };

        Ok(GroupCreation {
            stream: stream.to_string(),
            group,
            status,
        })
    }

    pub async fn get_consumer_groups(&self, stream: &str) -> Vec<GroupInfo> {
        self.broker
            .groups(stream)
            .await
            .unwrap_or_else(|e| degrade("groups", stream, e))
    }

    pub async fn get_consumers(&self, stream: &str, group: &str) -> Vec<ConsumerInfo> {
        self.broker
            .consumers(stream, group)
            .await
            .unwrap_or_else(|e| degrade("consumers", stream, e))
    }

    pub async fn get_pending_summary(&self, stream: &str, group: &str) -> PendingSummary {
        self.broker
            .pending(stream, group)
            .await
            .unwrap_or_else(|e| degrade("pending", stream, e))
    }

    pub async fn get_stream_info(&self, stream: &str) -> StreamInfo {
        self.broker
            .stream_info(stream)
            .await
            .unwrap_or_else(|e| degrade("stream info", stream, e))
    }

    /// Delete consumers idle longer than `threshold` (default 2h).
    ///
    /// Consumers that still own pending entries are kept: deleting them
    /// would drop those entries from the group's pending list.
    pub async fn cleanup_idle_consumers(
        &self,
        stream: &str,
        tenant_id: &str,
        threshold: Option<Duration>,
    ) -> CleanupReport {
        let threshold = threshold.unwrap_or(DEFAULT_IDLE_CONSUMER_THRESHOLD);
        let group = self.generate_consumer_group_name(stream, tenant_id);
        let own_name = self.generate_consumer_name(stream, tenant_id);
        let mut report = CleanupReport::default();

        for consumer in self.get_consumers(stream, &group).await {
            if consumer.name == own_name || consumer.idle_ms < threshold.as_millis() as u64 {
                continue;
            }
            if consumer.pending > 0 {
                debug!(
                    consumer = %consumer.name,
                    pending = consumer.pending,
                    "Idle consumer still owns pending messages, keeping"
                );
                report.kept_with_pending.push(consumer.name);
                continue;
            }

            match self.broker.delete_consumer(stream, &group, &consumer.name).await {
                Ok(_) => {
                    info!(
                        stream = %stream,
                        group = %group,
                        consumer = %consumer.name,
                        idle_ms = consumer.idle_ms,
                        "Removed idle consumer"
                    );
                    report.removed.push(consumer.name);
                }
                Err(e) => {
                    warn!(consumer = %consumer.name, error = %e, "Failed to remove idle consumer");
                    report.failed.push(consumer.name);
                }
            }
        }

        report
    }

    /// Per-stream status for `tenant_id` across every configured stream.
    pub async fn health_check(&self, tenant_id: &str) -> CoordinatorHealth {
        let mut streams = Vec::with_capacity(self.streams.len());
        let mut total_pending = 0;

        for stream in self.streams.keys() {
            let group = self.generate_consumer_group_name(&stream, tenant_id);
            let entry = match self.stream_health(&stream, &group).await {
                Ok(entry) => entry,
                Err(e) => StreamHealth {
                    stream: stream.clone(),
                    group,
                    healthy: false,
                    length: 0,
                    pending: 0,
                    consumers: 0,
                    error: Some(e.to_string()),
                },
            };
            total_pending += entry.pending;
            streams.push(entry);
        }

        let status = if streams.iter().all(|s| s.healthy) {
            "healthy"
        } else {
            "degraded"
        };

        CoordinatorHealth {
            status: status.to_string(),
            tenant_id: tenant_id.to_string(),
            total_pending,
            streams,
        }
    }

    async fn stream_health(&self, stream: &str, group: &str) -> Result<StreamHealth, BrokerError> {
        let info = match self.broker.stream_info(stream).await {
            Ok(info) => info,
            Err(e) if e.is_missing() => StreamInfo::default(),
            Err(e) => return Err(e),
        };
        let group_info = match self.broker.groups(stream).await {
            Ok(groups) => groups.into_iter().find(|g| g.name == group),
            Err(e) if e.is_missing() => None,
            Err(e) => return Err(e),
        };

        Ok(StreamHealth {
            stream: stream.to_string(),
            group: group.to_string(),
            healthy: true,
            length: info.length,
            pending: group_info.as_ref().map_or(0, |g| g.pending),
            consumers: group_info.as_ref().map_or(0, |g| g.consumers),
            error: None,
        })
    }

    /// XTRIM every configured stream to roughly `max_len` entries.
    pub async fn trim_streams(&self, max_len: usize) -> u64 {
        let mut total = 0;
        for stream in self.streams.keys() {
            match self.broker.trim(&stream, max_len).await {
                Ok(removed) => total += removed,
                Err(e) => warn!(stream = %stream, error = %e, "Failed to trim stream"),
            }
        }
        info!(removed = total, max_len = max_len, "Trimmed streams");
        total
    }
}

fn degrade<T: Default>(what: &str, stream: &str, error: BrokerError) -> T {
    if error.is_missing() {
        debug!(stream = %stream, "No {} yet: {}", what, error);
    } else {
        warn!(stream = %stream, error = %error, "Failed to read {}", what);
    }
    T::default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{MemoryBroker, ReadCursor};

    const TENANT: &str = "4f1c2a9e-8b7d-4e6f-a5c3-1d2e3f4a5b6c";

    fn coordinator(broker: Arc<MemoryBroker>) -> ConsumerGroupCoordinator {
        let settings = CoordinatorSettings {
            base_group: "crm".to_string(),
            app_name: "sync".to_string(),
            instance_id: "a1".to_string(),
            start_id: "0".to_string(),
        };
        ConsumerGroupCoordinator::new(broker, Arc::new(StreamTable::standard()), settings)
    }

    #[test]
    fn test_naming() {
        let c = coordinator(Arc::new(MemoryBroker::new()));
        let stream = "crm:sync:role:role_permissions_changed";
        assert_eq!(
            c.generate_consumer_group_name(stream, TENANT),
            format!("crm:role-events:{}", TENANT)
        );
        assert_eq!(
            c.generate_consumer_name(stream, TENANT),
            format!("sync-role-events-{}-a1", TENANT)
        );
        assert_eq!(
            c.generate_consumer_group_name("mystery", "t"),
            "crm:unknown-events:t"
        );
    }

    #[tokio::test]
    async fn test_create_groups_is_idempotent() {
        let c = coordinator(Arc::new(MemoryBroker::new()));
        let streams = vec!["credit-events".to_string(), "crm:organization-assignments".to_string()];

        let first = c.create_consumer_groups(&streams, TENANT).await;
        assert_eq!(first.created.len(), 2);
        assert!(first.failed.is_empty());

        let second = c.create_consumer_groups(&streams, TENANT).await;
        assert!(second.created.is_empty());
        assert_eq!(second.existing.len(), 2);
        assert_eq!(second.ready(), 2);
    }

    #[tokio::test]
    async fn test_partial_failure_does_not_abort() {
        let broker = Arc::new(MemoryBroker::new());
        let c = coordinator(broker.clone());
        broker.reject_groups_on("crm:sync:role:role_deleted");
        let streams = vec![
            "credit-events".to_string(),
            "crm:sync:role:role_deleted".to_string(),
            "crm:organization-assignments".to_string(),
            "crm:sync:user:user_created".to_string(),
        ];

        let report = c.create_consumer_groups(&streams, TENANT).await;
        assert_eq!(report.created.len(), 3);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].stream, "crm:sync:role:role_deleted");
        assert_eq!(report.ready(), 3);

        for good in ["credit-events", "crm:organization-assignments", "crm:sync:user:user_created"] {
            let groups = c.get_consumer_groups(good).await;
            assert_eq!(groups.len(), 1, "group missing on {}", good);
        }
        assert!(c.get_consumer_groups("crm:sync:role:role_deleted").await.is_empty());

        broker.allow_groups_on("crm:sync:role:role_deleted");
        let report = c.create_consumer_groups(&streams, TENANT).await;
        assert_eq!(report.created.len(), 1);
        assert_eq!(report.existing.len(), 3);
        assert!(report.failed.is_empty());
    }

    #[tokio::test]
    async fn test_inspection_degrades_on_missing_stream() {
        let c = coordinator(Arc::new(MemoryBroker::new()));
        assert!(c.get_consumer_groups("nope").await.is_empty());
        assert!(c.get_consumers("nope", "g").await.is_empty());
        assert_eq!(c.get_pending_summary("nope", "g").await.count, 0);
        assert_eq!(c.get_stream_info("nope").await.length, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_keeps_consumers_with_pending() {
        let broker = Arc::new(MemoryBroker::new());
        let c = coordinator(broker.clone());
        let stream = "credit-events".to_string();
        c.create_consumer_group(&stream, TENANT).await.unwrap();
        let group = c.generate_consumer_group_name(&stream, TENANT);

        broker
            .append(&stream, &[("k".to_string(), "v".to_string())], None)
            .await
            .unwrap();
        let streams = vec![stream.clone()];
        broker
            .read_group(&group, "old-busy", &streams, ReadCursor::New, 10, None)
            .await
            .unwrap();
        broker
            .read_group(&group, "old-idle", &streams, ReadCursor::New, 10, None)
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(3 * 60 * 60)).await;
        broker
            .read_group(&group, "fresh", &streams, ReadCursor::New, 10, None)
            .await
            .unwrap();

        let report = c.cleanup_idle_consumers(&stream, TENANT, None).await;
        assert_eq!(report.removed, vec!["old-idle".to_string()]);
        assert_eq!(report.kept_with_pending, vec!["old-busy".to_string()]);

        let names: Vec<String> = c
            .get_consumers(&stream, &group)
            .await
            .into_iter()
            .map(|c| c.name)
            .collect();
        assert_eq!(names, vec!["fresh".to_string(), "old-busy".to_string()]);
    }

    #[tokio::test]
    async fn test_health_check_reports_pending() {
        let broker = Arc::new(MemoryBroker::new());
        let c = coordinator(broker.clone());
        let stream = "credit-events".to_string();
        c.create_consumer_group(&stream, TENANT).await.unwrap();
        broker
            .append(&stream, &[("k".to_string(), "v".to_string())], None)
            .await
            .unwrap();
        let group = c.generate_consumer_group_name(&stream, TENANT);
        broker
            .read_group(&group, "c", &[stream.clone()], ReadCursor::New, 10, None)
            .await
            .unwrap();

        let health = c.health_check(TENANT).await;
        assert_eq!(health.status, "healthy");
        assert_eq!(health.total_pending, 1);
        assert_eq!(health.streams.len(), StreamTable::standard().len());
    }

    #[tokio::test]
    async fn test_health_check_marks_errors_unhealthy() {
        let broker = Arc::new(MemoryBroker::new());
        let c = coordinator(broker.clone());
        broker.close().await;

        let health = c.health_check(TENANT).await;
        assert_eq!(health.status, "degraded");
        assert!(health.streams.iter().all(|s| !s.healthy && s.error.is_some()));
    }
}
