use std::fmt::Debug;
use std::sync::Arc;
use anyhow::Result;
use chrono::{DateTime, Utc};

use super::event::MetaData;

// ============================================================================
// Event Versioning Support
// ============================================================================
//
// Upcasters rewrite stored payloads at read time so that old events match
// the shape the current code expects. Persisted bytes are never touched.
//
// ============================================================================

/// A deserialized-but-not-yet-typed event flowing through the upcaster chain.
#[derive(Clone, Debug, PartialEq)]
pub struct IntermediateEvent {
    pub aggregate_id: String,
    pub sequence_number: u64,
    pub timestamp: DateTime<Utc>,
    pub payload_type: String,
    pub payload_revision: Option<String>,
    pub payload: serde_json::Value,
    pub metadata: MetaData,
}

/// Upcaster trait for evolving event schemas
pub trait EventUpcaster: Send + Sync + Debug {
    fn can_upcast(&self, event: &IntermediateEvent) -> bool;

    fn upcast(&self, event: IntermediateEvent) -> Result<IntermediateEvent>;
}

/// Ordered list of upcasters. Each event is offered to every upcaster in
/// turn, so a v1 payload can be walked to v3 through v2.
#[derive(Clone, Debug, Default)]
pub struct UpcasterChain {
    upcasters: Vec<Arc<dyn EventUpcaster>>,
}

impl UpcasterChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, upcaster: impl EventUpcaster + 'static) -> Self {
        self.upcasters.push(Arc::new(upcaster));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.upcasters.is_empty()
    }

    pub fn upcast(&self, mut event: IntermediateEvent) -> Result<IntermediateEvent> {
        for upcaster in &self.upcasters {
            if upcaster.can_upcast(&event) {
                let from = event.payload_revision.clone();
                event = upcaster.upcast(event)?;
                tracing::debug!(
                    payload_type = %event.payload_type,
                    from_revision = ?from,
                    to_revision = ?event.payload_revision,
                    "Upcast event payload"
                );
            }
        }
        Ok(event)
    }
}

type PayloadTransform = dyn Fn(serde_json::Value) -> Result<serde_json::Value> + Send + Sync;

/// Upcaster for one payload type moving from one revision to the next.
pub struct RevisionUpcaster {
    payload_type: String,
    from_revision: Option<String>,
    to_revision: Option<String>,
    transform: Box<PayloadTransform>,
}

impl RevisionUpcaster {
    pub fn new<F>(payload_type: &str, from_revision: Option<&str>, to_revision: Option<&str>, transform: F) -> Self
    where
        F: Fn(serde_json::Value) -> Result<serde_json::Value> + Send + Sync + 'static,
    {
        Self {
            payload_type: payload_type.to_string(),
            from_revision: from_revision.map(str::to_string),
            to_revision: to_revision.map(str::to_string),
            transform: Box::new(transform),
        }
    }
}

impl Debug for RevisionUpcaster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RevisionUpcaster")
            .field("payload_type", &self.payload_type)
            .field("from_revision", &self.from_revision)
            .field("to_revision", &self.to_revision)
            .finish()
    }
}

impl EventUpcaster for RevisionUpcaster {
    fn can_upcast(&self, event: &IntermediateEvent) -> bool {
        event.payload_type == self.payload_type && event.payload_revision == self.from_revision
    }

    fn upcast(&self, mut event: IntermediateEvent) -> Result<IntermediateEvent> {
        event.payload = (self.transform)(event.payload)?;
        event.payload_revision = self.to_revision.clone();
        Ok(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn intermediate(payload_type: &str, revision: Option<&str>, payload: serde_json::Value) -> IntermediateEvent {
        IntermediateEvent {
            aggregate_id: "agg".to_string(),
            sequence_number: 0,
            timestamp: Utc::now(),
            payload_type: payload_type.to_string(),
            payload_revision: revision.map(str::to_string),
            payload,
            metadata: MetaData::new(),
        }
    }

    #[test]
    fn test_chain_walks_revisions_in_order() {
        let chain = UpcasterChain::new()
            .with(RevisionUpcaster::new("Renamed", None, Some("1"), |mut v| {
                v["full_name"] = v["name"].take();
                Ok(v)
            }))
            .with(RevisionUpcaster::new("Renamed", Some("1"), Some("2"), |mut v| {
                v["version"] = json!(2);
                Ok(v)
            }));

        let out = chain.upcast(intermediate("Renamed", None, json!({"name": "x"}))).unwrap();

        assert_eq!(out.payload_revision.as_deref(), Some("2"));
        assert_eq!(out.payload["full_name"], json!("x"));
        assert_eq!(out.payload["version"], json!(2));
    }

    #[test]
    fn test_other_payload_types_pass_through() {
        let chain = UpcasterChain::new()
            .with(RevisionUpcaster::new("A", None, Some("1"), |_| Ok(json!("changed"))));

        let input = intermediate("B", None, json!("kept"));
        let out = chain.upcast(input.clone()).unwrap();
        assert_eq!(out, input);
    }

    #[test]
    fn test_failing_upcaster_propagates() {
        let chain = UpcasterChain::new()
            .with(RevisionUpcaster::new("A", None, Some("1"), |_| anyhow::bail!("unsupported shape")));

        let result = chain.upcast(intermediate("A", None, json!({})));
        assert!(result.is_err());
    }
}
