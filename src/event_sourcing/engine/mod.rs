use chrono::{DateTime, Duration, Utc};
use futures_util::stream::{self, BoxStream, StreamExt, TryStreamExt};
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

use crate::config::{EngineConfig, SnapshotRetention};
use crate::error::{EventStoreError, Result, StoreError};
use crate::event_sourcing::commit::{decode, Commit, CommitKey, TrackingToken};
use crate::event_sourcing::conflict::{classify, conflict_kind, ConflictResolver, DuplicateKeyResolver};
use crate::event_sourcing::core::{
    DomainEventMessage, DomainSnapshot, EventData, IntermediateEvent, JsonSerializer, MetaData,
    Serializer, SnapshotDocument, TrackedEventData, TrackedEventMessage, UpcasterChain,
};
use crate::event_sourcing::store::DocumentStore;
use crate::event_sourcing::strategy::StorageStrategy;
use crate::metrics::EventStoreMetrics;

mod streaming;

pub use streaming::{EventSubscription, ReadMode, TrackedEventStream};

// ============================================================================
// Event Storage Engine
// ============================================================================
//
// Write path:
//   events -> group by aggregate -> contiguity pre-check -> strategy
//          -> DocumentStore::insert_commit -> (on failure) conflict classifier
//
// Read path:
//   DocumentStore scan -> commit decode -> token filter -> serializer
//          -> upcaster chain -> TrackedEventMessage
//
// The engine holds no locks and never retries. Two writers racing on the
// same aggregate are arbitrated by the store's (aggregate_id, first_sequence)
// uniqueness constraint alone.
//
// ============================================================================

const COMMITS_COLLECTION: &str = "event_commits";

/// Replay of one aggregate: the newest usable snapshot and the events after it.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateHistory {
    pub snapshot: Option<DomainSnapshot>,
    pub events: Vec<DomainEventMessage>,
}

impl AggregateHistory {
    /// Sequence number of the last event or snapshot, if any.
    pub fn last_sequence_number(&self) -> Option<u64> {
        self.events
            .last()
            .map(|event| event.sequence_number)
            .or_else(|| self.snapshot.as_ref().map(|snapshot| snapshot.sequence_number))
    }
}

/// Result of scanning the timeline after a token.
#[derive(Debug, Default)]
pub(crate) struct FetchedBatch {
    pub events: Vec<TrackedEventData>,
    /// Position after the last scanned commit, `None` when nothing was scanned.
    pub scanned_to: Option<TrackingToken>,
}

#[derive(Clone)]
pub struct EventStorageEngine {
    store: Arc<dyn DocumentStore>,
    serializer: Arc<dyn Serializer>,
    snapshot_serializer: Arc<dyn Serializer>,
    upcasters: UpcasterChain,
    conflict_resolver: Option<Arc<dyn ConflictResolver>>,
    strategy: Arc<dyn StorageStrategy>,
    config: EngineConfig,
    metrics: Option<Arc<EventStoreMetrics>>,
}

impl std::fmt::Debug for EventStorageEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStorageEngine")
            .field("store", &self.store)
            .field("serializer", &self.serializer.name())
            .field("strategy", &self.strategy.name())
            .field("conflict_resolver", &self.conflict_resolver)
            .field("config", &self.config)
            .finish()
    }
}

pub struct EventStorageEngineBuilder {
    store: Arc<dyn DocumentStore>,
    serializer: Arc<dyn Serializer>,
    snapshot_serializer: Option<Arc<dyn Serializer>>,
    upcasters: UpcasterChain,
    conflict_resolver: Option<Arc<dyn ConflictResolver>>,
    config: EngineConfig,
    metrics: Option<Arc<EventStoreMetrics>>,
}

impl EventStorageEngineBuilder {
    pub fn serializer(mut self, serializer: Arc<dyn Serializer>) -> Self {
        self.serializer = serializer;
        self
    }

    /// Serializer for snapshot payloads; defaults to the event serializer.
    pub fn snapshot_serializer(mut self, serializer: Arc<dyn Serializer>) -> Self {
        self.snapshot_serializer = Some(serializer);
        self
    }

    pub fn upcaster_chain(mut self, upcasters: UpcasterChain) -> Self {
        self.upcasters = upcasters;
        self
    }

    pub fn conflict_resolver(mut self, resolver: Arc<dyn ConflictResolver>) -> Self {
        self.conflict_resolver = Some(resolver);
        self
    }

    /// Report duplicate keys as unclassified `StorageConflict`s.
    pub fn without_conflict_resolver(mut self) -> Self {
        self.conflict_resolver = None;
        self
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn metrics(mut self, metrics: Arc<EventStoreMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn build(self) -> EventStorageEngine {
        let snapshot_serializer = self.snapshot_serializer.unwrap_or_else(|| self.serializer.clone());
        EventStorageEngine {
            store: self.store,
            serializer: self.serializer,
            snapshot_serializer,
            upcasters: self.upcasters,
            conflict_resolver: self.conflict_resolver,
            strategy: self.config.storage_strategy.build(),
            config: self.config,
            metrics: self.metrics,
        }
    }
}

impl EventStorageEngine {
    pub fn builder(store: Arc<dyn DocumentStore>) -> EventStorageEngineBuilder {
        EventStorageEngineBuilder {
            store,
            serializer: Arc::new(JsonSerializer),
            snapshot_serializer: None,
            upcasters: UpcasterChain::new(),
            conflict_resolver: Some(Arc::new(DuplicateKeyResolver)),
            config: EngineConfig::default(),
            metrics: None,
        }
    }

    /// Engine with JSON serialization, no upcasters and default configuration.
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self::builder(store).build()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // ========================================================================
    // Write path
    // ========================================================================

    /// Append events, grouped per aggregate in first-seen order.
    ///
    /// Each aggregate's events must continue its stream exactly: the first
    /// one carries the last stored sequence number + 1 (or 0 for a new
    /// aggregate) and the rest follow without gaps. Every run is validated
    /// before anything is written; documents are then persisted one by one,
    /// each atomically. A failed write is classified and returned without
    /// retrying; documents written before it stay written.
    pub async fn append_events(&self, events: Vec<DomainEventMessage>) -> Result<()> {
        if events.is_empty() {
            return Ok(());
        }

        let mut runs: Vec<(String, Vec<EventData>)> = Vec::new();
        for event in &events {
            let data = self.to_event_data(event)?;
            match runs.iter_mut().find(|(aggregate_id, _)| *aggregate_id == data.aggregate_id) {
                Some((_, run)) => run.push(data),
                None => runs.push((data.aggregate_id.clone(), vec![data])),
            }
        }

        let mut planned: Vec<(String, Vec<Commit>)> = Vec::with_capacity(runs.len());
        for (aggregate_id, run) in runs {
            self.check_continuation(&aggregate_id, &run).await?;
            let documents = self.strategy.create_documents(&aggregate_id, &run)?;
            planned.push((aggregate_id, documents));
        }

        for (aggregate_id, documents) in planned {
            for document in documents {
                self.persist(&aggregate_id, document).await?;
            }
        }

        Ok(())
    }

    async fn check_continuation(&self, aggregate_id: &str, run: &[EventData]) -> Result<()> {
        let Some(first) = run.first().map(|event| event.sequence_number) else {
            return Ok(());
        };

        let expected = match self.store.last_sequence_number(aggregate_id).await? {
            Some(last) => last + 1,
            None => 0,
        };

        if first > expected {
            return Err(EventStoreError::InvalidBatch(format!(
                "aggregate '{}' expects sequence {} next, got {}",
                aggregate_id, expected, first
            )));
        }

        if first < expected {
            // Overlaps an existing commit, possibly not at its first sequence,
            // so the unique index alone would not catch it
            let duplicate = StoreError::DuplicateKey {
                collection: COMMITS_COLLECTION,
                key: format!("{}/{}", aggregate_id, first),
            };
            let error = classify(self.conflict_resolver.as_deref(), aggregate_id, first, duplicate);
            self.record_failure(&error);
            return Err(error);
        }

        Ok(())
    }

    async fn persist(&self, aggregate_id: &str, commit: Commit) -> Result<()> {
        let first = commit.first_sequence;
        let last = commit.last_sequence;
        let count = commit.len();

        match self.store.insert_commit(commit).await {
            Ok(key) => {
                tracing::info!(
                    aggregate_id = %aggregate_id,
                    first = first,
                    last = last,
                    commit_id = %key.commit_id,
                    strategy = self.strategy.name(),
                    "📝 Appended commit"
                );
                if let Some(metrics) = &self.metrics {
                    metrics.record_commit(self.strategy.name(), count);
                }
                Ok(())
            }
            Err(error) => {
                let error = classify(self.conflict_resolver.as_deref(), aggregate_id, first, error);
                self.record_failure(&error);
                Err(error)
            }
        }
    }

    fn record_failure(&self, error: &EventStoreError) {
        if let Some(metrics) = &self.metrics {
            if error.is_conflict() {
                metrics.record_conflict(conflict_kind(error));
            }
        }
    }

    /// Highest stored sequence number of an aggregate, `None` if it has no events.
    pub async fn last_sequence_number_for(&self, aggregate_id: &str) -> Result<Option<u64>> {
        Ok(self.store.last_sequence_number(aggregate_id).await?)
    }

    // ========================================================================
    // Tokens
    // ========================================================================

    /// Position before every stored event.
    pub fn create_tail_token(&self) -> TrackingToken {
        TrackingToken::tail()
    }

    /// Position after every event stored so far.
    pub async fn create_head_token(&self) -> Result<TrackingToken> {
        let Some(last) = self.store.last_commit().await? else {
            return Ok(TrackingToken::tail());
        };

        let look_back = self.store.look_back();
        if look_back <= Duration::zero() {
            return Ok(TrackingToken::after_commit(last.key(), last.event_count()));
        }

        // Everything already visible inside the window counts as delivered
        let from = CommitKey::new(last.commit_timestamp - look_back, Uuid::nil());
        let token = self
            .store
            .commits_after(Some(&from), true, usize::MAX)
            .await?
            .iter()
            .chain(std::iter::once(&last))
            .fold(TrackingToken::tail(), |token, commit| {
                token.advanced(commit.key(), commit.event_count(), look_back)
            });
        Ok(token)
    }

    /// Token from which reads yield exactly the events stamped at or after `instant`.
    pub async fn create_token_at(&self, instant: DateTime<Utc>) -> Result<TrackingToken> {
        let token = match self.store.first_commit_with_event_since(instant).await? {
            Some(key) => TrackingToken::before(key),
            None => self.create_head_token().await?,
        };
        Ok(token.with_lower_bound(Some(instant)))
    }

    // ========================================================================
    // Tracked reads
    // ========================================================================

    /// Events of up to `batch_size` commits after `token`, each paired with
    /// the token that resumes right after it. Commits whose remaining events
    /// all fall before the token's lower bound are passed over without
    /// counting toward `batch_size`.
    pub async fn fetch_tracked_events(
        &self,
        token: &TrackingToken,
        batch_size: usize,
    ) -> Result<Vec<TrackedEventMessage>> {
        let events = self
            .fetch_batch(token, batch_size)
            .await?
            .events
            .into_iter()
            .map(|tracked| self.to_tracked_message(tracked))
            .collect::<Result<Vec<_>>>()?;
        if let Some(metrics) = &self.metrics {
            metrics.record_delivered(events.len());
        }
        Ok(events)
    }

    /// Scan the timeline after `token` until `batch_size` commits yielded
    /// events or the timeline ends.
    ///
    /// With a store look-back window the scan starts that far behind the
    /// token's position, so commits that became visible after the token
    /// passed their key are delivered too.
    pub(crate) async fn fetch_batch(&self, token: &TrackingToken, batch_size: usize) -> Result<FetchedBatch> {
        let started = Instant::now();
        let batch_size = batch_size.max(1);
        let look_back = self.store.look_back();

        let mut cursor = token.position().map(|position| {
            if look_back > Duration::zero() {
                CommitKey::new(position.timestamp - look_back, Uuid::nil())
            } else {
                *position
            }
        });
        let mut inclusive = true;

        let mut batch = FetchedBatch::default();
        let mut running = token.clone();
        let mut taken = 0;

        'scan: loop {
            // One extra commit in case the token's own commit is already exhausted
            let page = self
                .store
                .commits_after(cursor.as_ref(), inclusive, batch_size + 1)
                .await?;
            let timeline_end = page.len() <= batch_size;

            for commit in page {
                let key = commit.key();
                cursor = Some(key);
                inclusive = false;

                if !commit
                    .events
                    .iter()
                    .any(|entry| token.is_pending(&key, entry.offset, look_back))
                {
                    continue;
                }
                if taken == batch_size {
                    break 'scan;
                }

                let before = batch.events.len();
                for (entry, event) in commit.events.iter().zip(decode(&commit)) {
                    if token.is_pending(&key, entry.offset, look_back) && token.admits(entry.timestamp) {
                        running = running.advanced(key, entry.offset.saturating_add(1), look_back);
                        batch.events.push(TrackedEventData {
                            token: running.clone(),
                            event,
                        });
                    }
                }
                running = running.advanced(key, commit.event_count(), look_back);
                batch.scanned_to = Some(running.clone());

                if batch.events.len() > before {
                    taken += 1;
                }
            }

            if timeline_end {
                break;
            }
        }

        tracing::debug!(
            token = %token,
            commit_count = taken,
            event_count = batch.events.len(),
            "Fetched tracked event batch"
        );
        if let Some(metrics) = &self.metrics {
            metrics.record_fetch(started.elapsed().as_secs_f64());
        }

        Ok(batch)
    }

    /// Stream events after `token`.
    ///
    /// [`ReadMode::Finite`] ends once caught up; [`ReadMode::Follow`] keeps
    /// polling every `poll_interval` until cancelled or dropped. A failure
    /// is yielded once and ends the stream.
    pub fn read_events(&self, token: TrackingToken, mode: ReadMode) -> TrackedEventStream {
        TrackedEventStream::open(self.clone(), token, mode)
    }

    // ========================================================================
    // Aggregate replay
    // ========================================================================

    /// Events of one aggregate from `first_sequence` on, fetched in pages
    /// of `batch_size` commits.
    pub fn read_aggregate_events(
        &self,
        aggregate_id: &str,
        first_sequence: u64,
    ) -> BoxStream<'static, Result<DomainEventMessage>> {
        let engine = self.clone();
        let aggregate_id = aggregate_id.to_string();

        stream::try_unfold(Some(first_sequence), move |next| {
            let engine = engine.clone();
            let aggregate_id = aggregate_id.clone();
            async move {
                let Some(from) = next else {
                    return Ok(None);
                };
                engine
                    .aggregate_page(&aggregate_id, from)
                    .await
                    .map(|page| page.map(|(events, next)| (stream::iter(events.into_iter().map(Ok)), next)))
            }
        })
        .try_flatten()
        .boxed()
    }

    /// One page of an aggregate's events and the sequence number of the next page.
    async fn aggregate_page(
        &self,
        aggregate_id: &str,
        from: u64,
    ) -> Result<Option<(Vec<DomainEventMessage>, Option<u64>)>> {
        let commits = self
            .store
            .aggregate_commits(aggregate_id, from, self.config.batch_size)
            .await?;
        if commits.is_empty() {
            return Ok(None);
        }

        let next = match commits.last() {
            Some(last) if commits.len() >= self.config.batch_size => Some(last.last_sequence + 1),
            _ => None,
        };

        let events = commits
            .iter()
            .flat_map(decode)
            .filter(|event| event.sequence_number >= from)
            .map(|event| self.to_message(event))
            .collect::<Result<Vec<_>>>()?;

        Ok(Some((events, next)))
    }

    /// Newest usable snapshot plus the events stored after it.
    pub async fn read_aggregate(&self, aggregate_id: &str) -> Result<AggregateHistory> {
        let snapshot = self.read_snapshot(aggregate_id).await?;
        let from = snapshot.as_ref().map_or(0, |snapshot| snapshot.sequence_number + 1);
        let events = self.read_aggregate_events(aggregate_id, from).try_collect().await?;
        Ok(AggregateHistory { snapshot, events })
    }

    // ========================================================================
    // Snapshots
    // ========================================================================

    pub async fn store_snapshot(&self, snapshot: &DomainSnapshot) -> Result<()> {
        let document = SnapshotDocument {
            aggregate_id: snapshot.aggregate_id.clone(),
            aggregate_type: snapshot.aggregate_type.clone(),
            sequence_number: snapshot.sequence_number,
            payload_type: snapshot.payload_type.clone(),
            payload_revision: snapshot.payload_revision.clone(),
            payload: self.snapshot_serializer.serialize(&snapshot.payload)?,
            timestamp: snapshot.timestamp,
        };

        self.store.insert_snapshot(document).await?;

        let pruned = match self.config.snapshot_retention {
            SnapshotRetention::LatestOnly => {
                self.store
                    .delete_snapshots_before(&snapshot.aggregate_id, snapshot.sequence_number)
                    .await?
            }
            SnapshotRetention::Historical => 0,
        };

        tracing::info!(
            aggregate_id = %snapshot.aggregate_id,
            sequence_number = snapshot.sequence_number,
            pruned = pruned,
            "📸 Stored snapshot"
        );
        if let Some(metrics) = &self.metrics {
            metrics.snapshots_stored.inc();
        }
        Ok(())
    }

    /// Newest snapshot that can be decoded; older ones are tried in turn.
    pub async fn read_snapshot(&self, aggregate_id: &str) -> Result<Option<DomainSnapshot>> {
        for document in self.store.snapshots(aggregate_id).await? {
            let sequence_number = document.sequence_number;
            match self.to_snapshot(document) {
                Ok(snapshot) => return Ok(Some(snapshot)),
                Err(error) => {
                    tracing::warn!(
                        aggregate_id = %aggregate_id,
                        sequence_number = sequence_number,
                        error = %error,
                        "⚠️  Unusable snapshot, falling back to an older one"
                    );
                }
            }
        }
        Ok(None)
    }

    // ========================================================================
    // Conversions
    // ========================================================================

    fn to_event_data(&self, event: &DomainEventMessage) -> Result<EventData> {
        Ok(EventData {
            event_id: event.event_id,
            aggregate_id: event.aggregate_id.clone(),
            aggregate_type: event.aggregate_type.clone(),
            sequence_number: event.sequence_number,
            payload_type: event.payload_type.clone(),
            payload_revision: event.payload_revision.clone(),
            payload: self.serializer.serialize(&event.payload)?,
            metadata: self.serializer.serialize_metadata(&event.metadata)?,
            timestamp: event.timestamp,
        })
    }

    pub(crate) fn to_message(&self, data: EventData) -> Result<DomainEventMessage> {
        let intermediate = IntermediateEvent {
            payload: self.serializer.deserialize(&data.payload)?,
            metadata: self.serializer.deserialize_metadata(&data.metadata)?,
            aggregate_id: data.aggregate_id,
            sequence_number: data.sequence_number,
            timestamp: data.timestamp,
            payload_type: data.payload_type,
            payload_revision: data.payload_revision,
        };
        let upcast = self.upcast(intermediate)?;

        Ok(DomainEventMessage {
            event_id: data.event_id,
            aggregate_id: upcast.aggregate_id,
            aggregate_type: data.aggregate_type,
            sequence_number: upcast.sequence_number,
            payload_type: upcast.payload_type,
            payload_revision: upcast.payload_revision,
            payload: upcast.payload,
            metadata: upcast.metadata,
            timestamp: upcast.timestamp,
        })
    }

    pub(crate) fn to_tracked_message(&self, tracked: TrackedEventData) -> Result<TrackedEventMessage> {
        Ok(TrackedEventMessage {
            token: tracked.token,
            event: self.to_message(tracked.event)?,
        })
    }

    fn to_snapshot(&self, document: SnapshotDocument) -> Result<DomainSnapshot> {
        let intermediate = IntermediateEvent {
            payload: self.snapshot_serializer.deserialize(&document.payload)?,
            metadata: MetaData::new(),
            aggregate_id: document.aggregate_id,
            sequence_number: document.sequence_number,
            timestamp: document.timestamp,
            payload_type: document.payload_type,
            payload_revision: document.payload_revision,
        };
        let upcast = self.upcast(intermediate)?;

        Ok(DomainSnapshot {
            aggregate_id: upcast.aggregate_id,
            aggregate_type: document.aggregate_type,
            sequence_number: upcast.sequence_number,
            payload_type: upcast.payload_type,
            payload_revision: upcast.payload_revision,
            payload: upcast.payload,
            timestamp: upcast.timestamp,
        })
    }

    fn upcast(&self, event: IntermediateEvent) -> Result<IntermediateEvent> {
        if self.upcasters.is_empty() {
            return Ok(event);
        }
        let payload_type = event.payload_type.clone();
        self.upcasters
            .upcast(event)
            .map_err(|source| EventStoreError::UpcastFailure { payload_type, source })
    }
}
