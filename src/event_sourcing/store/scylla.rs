use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use scylla::client::session::Session;
use scylla::client::session_builder::SessionBuilder;
use scylla::response::query_result::QueryResult;
use scylla::value::{CqlValue, Row};
use std::sync::Arc;
use uuid::Uuid;

use crate::config::ScyllaConfig;
use crate::error::StoreError;
use crate::event_sourcing::commit::{Commit, CommitEntry, CommitKey};
use crate::event_sourcing::core::SnapshotDocument;
use super::{DocumentStore, StoreResult};

// ============================================================================
// ScyllaDB Document Store
// ============================================================================
//
// Tables:
// - event_commits:   PRIMARY KEY ((aggregate_id), first_sequence)
//                    written with IF NOT EXISTS; the LWT is the uniqueness
//                    constraint that arbitrates concurrent appenders
// - commit_timeline: PRIMARY KEY ((day_bucket), commit_timestamp, commit_id)
//                    denormalized copy used for global, resumable scans
// - snapshots:       PRIMARY KEY ((aggregate_id), sequence_number DESC)
//
// Limitations:
// - the timeline row is written after the LWT succeeds; a crash in between
//   leaves a commit that replays by aggregate but never streams
// - commit_timestamp comes from the writer's clock when the commit is
//   encoded, so a slow writer's timeline row can land behind commits other
//   writers made visible first. Readers rescan look_back below their
//   position to pick those up; a row landing later than that is missed
//
// ============================================================================

const SECONDS_PER_DAY: i64 = 86_400;

const TIMELINE_COLUMNS: &str =
    "commit_timestamp, commit_id, aggregate_id, aggregate_type, first_sequence, last_sequence, events";

type CommitRow = (DateTime<Utc>, Uuid, String, String, i64, i64, Vec<u8>);
type SnapshotRow = (String, i64, String, String, Option<String>, Vec<u8>, DateTime<Utc>);

#[derive(Debug, Clone)]
pub struct ScyllaDocumentStore {
    session: Arc<Session>,
    look_back: Duration,
}

impl ScyllaDocumentStore {
    pub fn new(session: Arc<Session>) -> Self {
        Self {
            session,
            look_back: look_back_window(ScyllaConfig::default().look_back),
        }
    }

    /// How long a commit may take between being stamped and becoming visible.
    pub fn with_look_back(mut self, look_back: std::time::Duration) -> Self {
        self.look_back = look_back_window(look_back);
        self
    }

    /// Connect, create the keyspace and tables if needed, and switch to the keyspace.
    pub async fn connect(config: &ScyllaConfig) -> StoreResult<Self> {
        tracing::info!(nodes = ?config.known_nodes, keyspace = %config.keyspace, "Connecting to ScyllaDB...");

        let mut builder = SessionBuilder::new();
        for node in &config.known_nodes {
            builder = builder.known_node(node);
        }
        let session = builder.build().await.map_err(StoreError::unavailable)?;

        session
            .query_unpaged(
                format!(
                    "CREATE KEYSPACE IF NOT EXISTS {} WITH REPLICATION = \
                     {{'class': 'SimpleStrategy', 'replication_factor': {}}}",
                    config.keyspace, config.replication_factor
                ),
                &[],
            )
            .await
            .map_err(StoreError::unavailable)?;
        session
            .use_keyspace(&config.keyspace, false)
            .await
            .map_err(StoreError::unavailable)?;

        let store = Self::new(Arc::new(session)).with_look_back(config.look_back);
        store.ensure_schema().await?;
        Ok(store)
    }

    pub async fn ensure_schema(&self) -> StoreResult<()> {
        let statements = [
            "CREATE TABLE IF NOT EXISTS event_commits (
                aggregate_id text,
                first_sequence bigint,
                last_sequence bigint,
                aggregate_type text,
                commit_timestamp timestamp,
                commit_id uuid,
                events blob,
                PRIMARY KEY ((aggregate_id), first_sequence)
            ) WITH CLUSTERING ORDER BY (first_sequence ASC)",
            "CREATE TABLE IF NOT EXISTS commit_timeline (
                day_bucket bigint,
                commit_timestamp timestamp,
                commit_id uuid,
                aggregate_id text,
                aggregate_type text,
                first_sequence bigint,
                last_sequence bigint,
                max_event_timestamp timestamp,
                events blob,
                PRIMARY KEY ((day_bucket), commit_timestamp, commit_id)
            ) WITH CLUSTERING ORDER BY (commit_timestamp ASC, commit_id ASC)",
            "CREATE TABLE IF NOT EXISTS snapshots (
                aggregate_id text,
                sequence_number bigint,
                aggregate_type text,
                payload_type text,
                payload_revision text,
                payload blob,
                snapshot_timestamp timestamp,
                PRIMARY KEY ((aggregate_id), sequence_number)
            ) WITH CLUSTERING ORDER BY (sequence_number DESC)",
        ];

        for statement in statements {
            self.session
                .query_unpaged(statement, &[])
                .await
                .map_err(StoreError::unavailable)?;
        }

        tracing::info!("✅ Event store schema ready");
        Ok(())
    }

    /// Timeline partitions present, ascending.
    async fn buckets(&self) -> StoreResult<Vec<i64>> {
        let result = self
            .session
            .query_unpaged("SELECT DISTINCT day_bucket FROM commit_timeline", &[])
            .await
            .map_err(StoreError::unavailable)?;

        let rows_result = result.into_rows_result().map_err(StoreError::corrupt)?;
        let mut buckets = Vec::new();
        for row in rows_result.rows::<(i64,)>().map_err(StoreError::corrupt)? {
            let (bucket,) = row.map_err(StoreError::corrupt)?;
            buckets.push(bucket);
        }
        buckets.sort_unstable();
        Ok(buckets)
    }

    async fn timeline_slice(
        &self,
        bucket: i64,
        from: Option<(&CommitKey, bool)>,
        limit: usize,
    ) -> StoreResult<Vec<Commit>> {
        let limit = i32::try_from(limit).unwrap_or(i32::MAX);
        let result = match from {
            Some((key, inclusive)) => {
                let op = if inclusive { ">=" } else { ">" };
                self.session
                    .query_unpaged(
                        format!(
                            "SELECT {} FROM commit_timeline WHERE day_bucket = ? \
                             AND (commit_timestamp, commit_id) {} (?, ?) LIMIT ?",
                            TIMELINE_COLUMNS, op
                        ),
                        (bucket, key.timestamp, key.commit_id, limit),
                    )
                    .await
            }
            None => {
                self.session
                    .query_unpaged(
                        format!("SELECT {} FROM commit_timeline WHERE day_bucket = ? LIMIT ?", TIMELINE_COLUMNS),
                        (bucket, limit),
                    )
                    .await
            }
        }
        .map_err(StoreError::unavailable)?;

        commits_from_result(result)
    }
}

fn day_bucket(timestamp: &DateTime<Utc>) -> i64 {
    timestamp.timestamp().div_euclid(SECONDS_PER_DAY)
}

fn to_i64(value: u64) -> StoreResult<i64> {
    i64::try_from(value).map_err(StoreError::corrupt)
}

fn to_u64(value: i64) -> StoreResult<u64> {
    u64::try_from(value).map_err(StoreError::corrupt)
}

fn commit_from_row(row: CommitRow) -> StoreResult<Commit> {
    let (commit_timestamp, commit_id, aggregate_id, aggregate_type, first, last, events) = row;
    let events: Vec<CommitEntry> = serde_json::from_slice(&events).map_err(StoreError::corrupt)?;
    Ok(Commit {
        commit_id,
        aggregate_id,
        aggregate_type,
        first_sequence: to_u64(first)?,
        last_sequence: to_u64(last)?,
        commit_timestamp,
        events,
    })
}

fn commits_from_result(result: QueryResult) -> StoreResult<Vec<Commit>> {
    let rows_result = result.into_rows_result().map_err(StoreError::corrupt)?;
    let mut commits = Vec::new();
    for row in rows_result.rows::<CommitRow>().map_err(StoreError::corrupt)? {
        commits.push(commit_from_row(row.map_err(StoreError::corrupt)?)?);
    }
    Ok(commits)
}

/// Read the `[applied]` column of a lightweight transaction result.
fn lwt_applied(result: QueryResult) -> StoreResult<bool> {
    let rows_result = result.into_rows_result().map_err(StoreError::corrupt)?;
    let row: Row = rows_result.first_row().map_err(StoreError::corrupt)?;
    match row.columns.first() {
        Some(Some(CqlValue::Boolean(applied))) => Ok(*applied),
        _ => Err(StoreError::Corrupt("LWT result without [applied] column".to_string())),
    }
}

fn look_back_window(look_back: std::time::Duration) -> Duration {
    Duration::milliseconds(i64::try_from(look_back.as_millis()).unwrap_or(i64::MAX / 1_000))
}

#[async_trait]
impl DocumentStore for ScyllaDocumentStore {
    async fn insert_commit(&self, commit: Commit) -> StoreResult<CommitKey> {
        let events = serde_json::to_vec(&commit.events).map_err(StoreError::corrupt)?;
        let first = to_i64(commit.first_sequence)?;
        let last = to_i64(commit.last_sequence)?;

        let result = self
            .session
            .query_unpaged(
                "INSERT INTO event_commits (
                    aggregate_id, first_sequence, last_sequence, aggregate_type,
                    commit_timestamp, commit_id, events
                ) VALUES (?, ?, ?, ?, ?, ?, ?) IF NOT EXISTS",
                (
                    commit.aggregate_id.as_str(),
                    first,
                    last,
                    commit.aggregate_type.as_str(),
                    commit.commit_timestamp,
                    commit.commit_id,
                    events.as_slice(),
                ),
            )
            .await
            .map_err(StoreError::unavailable)?;

        if !lwt_applied(result)? {
            return Err(StoreError::DuplicateKey {
                collection: "event_commits",
                key: format!("{}/{}", commit.aggregate_id, commit.first_sequence),
            });
        }

        let max_event_timestamp = commit.max_event_timestamp().unwrap_or(commit.commit_timestamp);
        self.session
            .query_unpaged(
                "INSERT INTO commit_timeline (
                    day_bucket, commit_timestamp, commit_id, aggregate_id, aggregate_type,
                    first_sequence, last_sequence, max_event_timestamp, events
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
                (
                    day_bucket(&commit.commit_timestamp),
                    commit.commit_timestamp,
                    commit.commit_id,
                    commit.aggregate_id.as_str(),
                    commit.aggregate_type.as_str(),
                    first,
                    last,
                    max_event_timestamp,
                    events.as_slice(),
                ),
            )
            .await
            .map_err(StoreError::unavailable)?;

        tracing::debug!(
            aggregate_id = %commit.aggregate_id,
            first = commit.first_sequence,
            last = commit.last_sequence,
            "Inserted commit into ScyllaDB"
        );

        Ok(commit.key())
    }

    fn look_back(&self) -> Duration {
        self.look_back
    }

    async fn last_sequence_number(&self, aggregate_id: &str) -> StoreResult<Option<u64>> {
        let result = self
            .session
            .query_unpaged(
                "SELECT last_sequence FROM event_commits WHERE aggregate_id = ? \
                 ORDER BY first_sequence DESC LIMIT 1",
                (aggregate_id,),
            )
            .await
            .map_err(StoreError::unavailable)?;

        let rows_result = result.into_rows_result().map_err(StoreError::corrupt)?;
        match rows_result.maybe_first_row::<(i64,)>().map_err(StoreError::corrupt)? {
            Some((last,)) => Ok(Some(to_u64(last)?)),
            None => Ok(None),
        }
    }

    async fn aggregate_commits(
        &self,
        aggregate_id: &str,
        from_sequence: u64,
        limit: usize,
    ) -> StoreResult<Vec<Commit>> {
        let from = to_i64(from_sequence)?;
        let columns = "commit_timestamp, commit_id, aggregate_id, aggregate_type, first_sequence, last_sequence, events";

        // The commit containing from_sequence may start before it
        let containing = self
            .session
            .query_unpaged(
                format!(
                    "SELECT {} FROM event_commits WHERE aggregate_id = ? AND first_sequence <= ? \
                     ORDER BY first_sequence DESC LIMIT 1",
                    columns
                ),
                (aggregate_id, from),
            )
            .await
            .map_err(StoreError::unavailable)?;

        let mut commits: Vec<Commit> = commits_from_result(containing)?
            .into_iter()
            .filter(|commit| commit.last_sequence >= from_sequence)
            .collect();

        let remaining = limit.saturating_sub(commits.len());
        if remaining > 0 {
            let later = self
                .session
                .query_unpaged(
                    format!(
                        "SELECT {} FROM event_commits WHERE aggregate_id = ? AND first_sequence > ? LIMIT ?",
                        columns
                    ),
                    (aggregate_id, from, i32::try_from(remaining).unwrap_or(i32::MAX)),
                )
                .await
                .map_err(StoreError::unavailable)?;
            commits.extend(commits_from_result(later)?);
        }

        commits.truncate(limit);
        Ok(commits)
    }

    async fn commits_after(
        &self,
        from: Option<&CommitKey>,
        inclusive: bool,
        limit: usize,
    ) -> StoreResult<Vec<Commit>> {
        let start_bucket = from.map(|key| day_bucket(&key.timestamp));
        let mut commits = Vec::new();

        for bucket in self.buckets().await? {
            if commits.len() >= limit {
                break;
            }
            if start_bucket.is_some_and(|start| bucket < start) {
                continue;
            }

            let bound = from.filter(|key| day_bucket(&key.timestamp) == bucket).map(|key| (key, inclusive));
            let slice = self.timeline_slice(bucket, bound, limit - commits.len()).await?;
            commits.extend(slice);
        }

        Ok(commits)
    }

    async fn first_commit_with_event_since(
        &self,
        instant: DateTime<Utc>,
    ) -> StoreResult<Option<CommitKey>> {
        for bucket in self.buckets().await? {
            let result = self
                .session
                .query_unpaged(
                    "SELECT commit_timestamp, commit_id FROM commit_timeline \
                     WHERE day_bucket = ? AND max_event_timestamp >= ? LIMIT 1 ALLOW FILTERING",
                    (bucket, instant),
                )
                .await
                .map_err(StoreError::unavailable)?;

            let rows_result = result.into_rows_result().map_err(StoreError::corrupt)?;
            if let Some((timestamp, commit_id)) = rows_result
                .maybe_first_row::<(DateTime<Utc>, Uuid)>()
                .map_err(StoreError::corrupt)?
            {
                return Ok(Some(CommitKey::new(timestamp, commit_id)));
            }
        }
        Ok(None)
    }

    async fn last_commit(&self) -> StoreResult<Option<Commit>> {
        for bucket in self.buckets().await?.into_iter().rev() {
            let result = self
                .session
                .query_unpaged(
                    format!(
                        "SELECT {} FROM commit_timeline WHERE day_bucket = ? \
                         ORDER BY commit_timestamp DESC, commit_id DESC LIMIT 1",
                        TIMELINE_COLUMNS
                    ),
                    (bucket,),
                )
                .await
                .map_err(StoreError::unavailable)?;

            if let Some(commit) = commits_from_result(result)?.into_iter().next() {
                return Ok(Some(commit));
            }
        }
        Ok(None)
    }

    async fn insert_snapshot(&self, snapshot: SnapshotDocument) -> StoreResult<()> {
        let result = self
            .session
            .query_unpaged(
                "INSERT INTO snapshots (
                    aggregate_id, sequence_number, aggregate_type, payload_type,
                    payload_revision, payload, snapshot_timestamp
                ) VALUES (?, ?, ?, ?, ?, ?, ?) IF NOT EXISTS",
                (
                    snapshot.aggregate_id.as_str(),
                    to_i64(snapshot.sequence_number)?,
                    snapshot.aggregate_type.as_str(),
                    snapshot.payload_type.as_str(),
                    snapshot.payload_revision.as_deref(),
                    snapshot.payload.as_slice(),
                    snapshot.timestamp,
                ),
            )
            .await
            .map_err(StoreError::unavailable)?;

        if !lwt_applied(result)? {
            return Err(StoreError::DuplicateKey {
                collection: "snapshots",
                key: format!("{}/{}", snapshot.aggregate_id, snapshot.sequence_number),
            });
        }
        Ok(())
    }

    async fn delete_snapshots_before(&self, aggregate_id: &str, sequence_number: u64) -> StoreResult<u64> {
        let before = to_i64(sequence_number)?;
        let stale = self
            .snapshots(aggregate_id)
            .await?
            .iter()
            .filter(|snapshot| snapshot.sequence_number < sequence_number)
            .count() as u64;

        if stale > 0 {
            self.session
                .query_unpaged(
                    "DELETE FROM snapshots WHERE aggregate_id = ? AND sequence_number < ?",
                    (aggregate_id, before),
                )
                .await
                .map_err(StoreError::unavailable)?;
        }
        Ok(stale)
    }

    async fn snapshots(&self, aggregate_id: &str) -> StoreResult<Vec<SnapshotDocument>> {
        let result = self
            .session
            .query_unpaged(
                "SELECT aggregate_id, sequence_number, aggregate_type, payload_type, \
                 payload_revision, payload, snapshot_timestamp \
                 FROM snapshots WHERE aggregate_id = ?",
                (aggregate_id,),
            )
            .await
            .map_err(StoreError::unavailable)?;

        let rows_result = result.into_rows_result().map_err(StoreError::corrupt)?;
        let mut snapshots = Vec::new();
        for row in rows_result.rows::<SnapshotRow>().map_err(StoreError::corrupt)? {
            let (aggregate_id, sequence_number, aggregate_type, payload_type, payload_revision, payload, timestamp) =
                row.map_err(StoreError::corrupt)?;
            snapshots.push(SnapshotDocument {
                aggregate_id,
                aggregate_type,
                sequence_number: to_u64(sequence_number)?,
                payload_type,
                payload_revision,
                payload,
                timestamp,
            });
        }
        Ok(snapshots)
    }
}

// ============================================================================
// Unit Tests
// ============================================================================
//
// Statements against a live cluster are exercised by running the binary
// with EVENT_STORE_BACKEND=scylla.
//
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_day_bucket_boundaries() {
        let midnight = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        let before = Utc.with_ymd_and_hms(2024, 2, 29, 23, 59, 59).unwrap();

        assert_eq!(day_bucket(&midnight), day_bucket(&before) + 1);
        assert_eq!(day_bucket(&Utc.timestamp_opt(-1, 0).unwrap()), -1);
    }

    #[test]
    fn test_look_back_window_conversion() {
        assert_eq!(look_back_window(std::time::Duration::from_secs(5)), Duration::seconds(5));
        assert_eq!(look_back_window(std::time::Duration::ZERO), Duration::zero());
        assert!(look_back_window(ScyllaConfig::default().look_back) > Duration::zero());
    }

    #[test]
    fn test_commit_row_decoding() {
        let entries = vec![CommitEntry {
            offset: 0,
            event_id: Uuid::new_v4(),
            payload_type: "Opened".to_string(),
            payload_revision: None,
            payload: b"{}".to_vec(),
            metadata: Vec::new(),
            timestamp: Utc::now(),
        }];
        let row: CommitRow = (
            Utc::now(),
            Uuid::now_v7(),
            "acc-1".to_string(),
            "Account".to_string(),
            4,
            4,
            serde_json::to_vec(&entries).unwrap(),
        );

        let commit = commit_from_row(row).unwrap();
        assert_eq!(commit.first_sequence, 4);
        assert_eq!(commit.events, entries);
    }

    #[test]
    fn test_negative_sequence_is_corrupt() {
        let row: CommitRow = (Utc::now(), Uuid::now_v7(), "a".to_string(), "A".to_string(), -1, 0, b"[]".to_vec());
        assert!(matches!(commit_from_row(row), Err(StoreError::Corrupt(_))));
    }
}
