//! JSONL audit writer
//!
//! Layout: `<dir>/<YYYY-MM-DD>/<tenant>.jsonl`, one JSON object per line.
//! Events without a tenant go to `_system.jsonl`. The date comes from the
//! event timestamp so replays land in the partition of the original day.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use strata_core::AuditEvent;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;

use crate::writer::{AuditWriter, WriterResult};

const SYSTEM_PARTITION: &str = "_system";

pub struct JsonlAuditWriter {
    audit_dir: PathBuf,
}

/// Sanitize a partition name to prevent path traversal
/// Allows only alphanumeric characters, hyphens, and underscores
fn sanitize_partition(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_alphanumeric() || *c == '-' || *c == '_')
        .take(255)
        .collect()
}

impl JsonlAuditWriter {
    pub fn new(audit_dir: impl Into<PathBuf>) -> Self {
        Self {
            audit_dir: audit_dir.into(),
        }
    }

    pub fn audit_dir(&self) -> &Path {
        &self.audit_dir
    }

    fn file_path(&self, event: &AuditEvent) -> PathBuf {
        let partition = event
            .tenant_id
            .map(|t| sanitize_partition(&t.to_string()))
            .unwrap_or_else(|| SYSTEM_PARTITION.to_string());
        self.audit_dir
            .join(event.timestamp.format("%Y-%m-%d").to_string())
            .join(format!("{}.jsonl", partition))
    }

    async fn open(&self, path: &Path) -> WriterResult<tokio::fs::File> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        Ok(file)
    }
}

#[async_trait]
impl AuditWriter for JsonlAuditWriter {
    async fn write_event(&self, event: &AuditEvent) -> WriterResult<()> {
        self.write_batch(std::slice::from_ref(event)).await
    }

    async fn write_batch(&self, events: &[AuditEvent]) -> WriterResult<()> {
        // One open per file, events kept in arrival order within each file
        let mut by_file: BTreeMap<PathBuf, Vec<&AuditEvent>> = BTreeMap::new();
        for event in events {
            by_file.entry(self.file_path(event)).or_default().push(event);
        }

        for (path, file_events) in by_file {
            let mut buf = Vec::new();
            for event in file_events {
                serde_json::to_writer(&mut buf, event)?;
                buf.push(b'\n');
            }

            let mut file = self.open(&path).await?;
            file.write_all(&buf).await?;
            file.flush().await?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use serde_json::json;
    use strata_core::{AuditOutcome, TenantId};
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_events_partitioned_by_day_and_tenant() {
        let dir = tempdir().unwrap();
        let writer = JsonlAuditWriter::new(dir.path());
        let tenant = TenantId::new();

        let mut first = AuditEvent::new("raw_event.ingest", AuditOutcome::Attempt, "raw_event", "")
            .with_tenant(tenant)
            .with_details(json!({"source_address": "203.0.113.9"}));
        first.timestamp = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let mut second = first.clone();
        second.event_type = "raw_event.ingest.success".to_string();
        let mut system = AuditEvent::new("pipeline.run", AuditOutcome::Success, "tenant", "*");
        system.timestamp = first.timestamp;

        writer
            .write_batch(&[first, second, system])
            .await
            .unwrap();

        let day = dir.path().join("2024-03-01");
        let content = tokio::fs::read_to_string(day.join(format!("{}.jsonl", tenant)))
            .await
            .unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        let parsed: AuditEvent = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(parsed.event_type, "raw_event.ingest.success");

        assert!(day.join("_system.jsonl").exists());
    }

    #[tokio::test]
    async fn test_appends_across_writes() {
        let dir = tempdir().unwrap();
        let writer = JsonlAuditWriter::new(dir.path());
        let event = AuditEvent::new("staging.process", AuditOutcome::Failure, "raw_event", "3");

        writer.write_event(&event).await.unwrap();
        writer.write_event(&event).await.unwrap();

        let path = writer.file_path(&event);
        let content = tokio::fs::read_to_string(path).await.unwrap();
        assert_eq!(content.lines().count(), 2);
    }

    #[test]
    fn test_sanitize_partition() {
        assert_eq!(sanitize_partition("a1b2-c3_d4"), "a1b2-c3_d4");
        assert_eq!(sanitize_partition("../../etc/passwd"), "etcpasswd");
        assert_eq!(sanitize_partition(&"x".repeat(300)).len(), 255);
    }
}
