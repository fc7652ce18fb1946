use serde::{Deserialize, Serialize};
use uuid::Uuid;
use chrono::{DateTime, Duration, Utc};
use std::fmt;
use std::str::FromStr;

use crate::error::EventStoreError;

// ============================================================================
// Tracking Token
// ============================================================================
//
// The global timeline is the sequence of commits ordered by
// (commit_timestamp, commit_id). A token names a commit on that timeline and
// how many of its events have already been handed out:
//
//   position = None            -> before the first commit
//   position = K, consumed = n -> events [0..n) of K delivered
//   consumed >= K's length     -> K fully delivered
//
// Tokens created by create_token_at also carry a lower time bound: events
// timestamped before it are skipped by every read resumed from the token.
//
// Backends whose keys come from the writers' clocks can land a commit behind
// a position a reader already passed. Reads against them rescan a look-back
// window below the position, and the token remembers which commits inside
// that window it has delivered (and how far), so late arrivals are delivered
// once and nothing is repeated.
//
// ============================================================================

const TOKEN_VERSION: &str = "v1";
const NONE_MARK: &str = "-";
const RECENT_SEPARATOR: &str = ",";
const ENTRY_SEPARATOR: &str = ".";

/// Global ordering key of a commit.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CommitKey {
    pub timestamp: DateTime<Utc>,
    pub commit_id: Uuid,
}

impl CommitKey {
    pub fn new(timestamp: DateTime<Utc>, commit_id: Uuid) -> Self {
        Self { timestamp, commit_id }
    }
}

/// Opaque, totally ordered position in the global event timeline.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TrackingToken {
    position: Option<CommitKey>,
    consumed: u32,
    /// Commits behind `position` inside the look-back window, with how many
    /// of their events were delivered. Sorted by key.
    recent: Vec<(CommitKey, u32)>,
    not_before: Option<DateTime<Utc>>,
}

impl TrackingToken {
    /// Position before any commit.
    pub fn tail() -> Self {
        Self {
            position: None,
            consumed: 0,
            recent: Vec::new(),
            not_before: None,
        }
    }

    /// Position right before the given commit: all of its events remain.
    pub fn before(key: CommitKey) -> Self {
        Self {
            position: Some(key),
            consumed: 0,
            recent: Vec::new(),
            not_before: None,
        }
    }

    /// Position right after the event stored at `offset` inside commit `key`.
    pub fn after_offset(key: CommitKey, offset: u32) -> Self {
        Self {
            position: Some(key),
            consumed: offset.saturating_add(1),
            recent: Vec::new(),
            not_before: None,
        }
    }

    /// Position after every event of a commit holding `event_count` events.
    pub fn after_commit(key: CommitKey, event_count: u32) -> Self {
        Self {
            position: Some(key),
            consumed: event_count,
            recent: Vec::new(),
            not_before: None,
        }
    }

    /// Restrict reads resumed from this token to events at or after `instant`.
    pub fn with_lower_bound(mut self, instant: Option<DateTime<Utc>>) -> Self {
        self.not_before = instant;
        self
    }

    pub fn position(&self) -> Option<&CommitKey> {
        self.position.as_ref()
    }

    pub fn consumed(&self) -> u32 {
        self.consumed
    }

    pub fn lower_bound(&self) -> Option<DateTime<Utc>> {
        self.not_before
    }

    /// Commits behind the position that this token has already seen.
    pub fn recent(&self) -> &[(CommitKey, u32)] {
        &self.recent
    }

    fn recent_consumed(&self, key: &CommitKey) -> Option<u32> {
        self.recent
            .binary_search_by(|(recent, _)| recent.cmp(key))
            .ok()
            .map(|index| self.recent[index].1)
    }

    /// Whether the event at `offset` of commit `key` lies strictly after this token.
    pub fn is_before(&self, key: &CommitKey, offset: u32) -> bool {
        match &self.position {
            None => true,
            Some(position) if position == key => offset >= self.consumed,
            Some(position) if position < key => true,
            Some(_) => self.recent_consumed(key).is_some_and(|consumed| offset >= consumed),
        }
    }

    /// Like [`is_before`](Self::is_before), but a commit behind the position
    /// that the token never saw and that lies within `look_back` of it is
    /// still pending: it landed after the reader passed its key.
    pub fn is_pending(&self, key: &CommitKey, offset: u32, look_back: Duration) -> bool {
        if self.is_before(key, offset) {
            return true;
        }
        match &self.position {
            Some(position) if look_back > Duration::zero() => {
                key < position
                    && self.recent_consumed(key).is_none()
                    && key.timestamp >= position.timestamp - look_back
            }
            _ => false,
        }
    }

    /// Token after delivering the first `consumed` events of commit `key`.
    ///
    /// The position only moves forward; a commit behind it is remembered in
    /// the look-back window instead. Entries older than `look_back` below
    /// the position are dropped.
    pub fn advanced(&self, key: CommitKey, consumed: u32, look_back: Duration) -> Self {
        let mut next = self.clone();
        match self.position {
            Some(position) if key < position => next.remember(key, consumed),
            Some(position) if key == position => next.consumed = self.consumed.max(consumed),
            Some(position) => {
                next.remember(position, self.consumed);
                next.position = Some(key);
                next.consumed = consumed;
            }
            None => {
                next.position = Some(key);
                next.consumed = consumed;
            }
        }
        next.prune(look_back);
        next
    }

    fn remember(&mut self, key: CommitKey, consumed: u32) {
        match self.recent.binary_search_by(|(recent, _)| recent.cmp(&key)) {
            Ok(index) => self.recent[index].1 = self.recent[index].1.max(consumed),
            Err(index) => self.recent.insert(index, (key, consumed)),
        }
    }

    fn prune(&mut self, look_back: Duration) {
        match self.position {
            Some(position) if look_back > Duration::zero() => {
                let horizon = position.timestamp - look_back;
                self.recent.retain(|(key, _)| key.timestamp >= horizon);
            }
            _ => self.recent.clear(),
        }
    }

    /// Whether a stored event passes this token's time bound.
    pub fn admits(&self, timestamp: DateTime<Utc>) -> bool {
        self.not_before.map_or(true, |bound| timestamp >= bound)
    }

    /// Stable external form, suitable for persisting by consumers.
    pub fn encode(&self) -> String {
        let (timestamp, commit_id) = match &self.position {
            Some(key) => (key.timestamp.timestamp_micros().to_string(), key.commit_id.simple().to_string()),
            None => (NONE_MARK.to_string(), NONE_MARK.to_string()),
        };
        let not_before = self
            .not_before
            .map_or_else(|| NONE_MARK.to_string(), |t| t.timestamp_micros().to_string());

        let recent = if self.recent.is_empty() {
            NONE_MARK.to_string()
        } else {
            self.recent
                .iter()
                .map(|(key, consumed)| {
                    format!(
                        "{}{}{}{}{}",
                        key.timestamp.timestamp_micros(),
                        ENTRY_SEPARATOR,
                        key.commit_id.simple(),
                        ENTRY_SEPARATOR,
                        consumed
                    )
                })
                .collect::<Vec<_>>()
                .join(RECENT_SEPARATOR)
        };

        format!(
            "{}:{}:{}:{}:{}:{}",
            TOKEN_VERSION, timestamp, commit_id, self.consumed, not_before, recent
        )
    }

    pub fn decode(encoded: &str) -> Result<Self, EventStoreError> {
        let invalid = |reason: &str| EventStoreError::InvalidToken(format!("'{}': {}", encoded, reason));

        // Tokens written before the look-back window existed have 5 fields
        let parts: Vec<&str> = encoded.split(':').collect();
        let (version, timestamp, commit_id, consumed, not_before, recent) = match parts.as_slice() {
            [version, timestamp, commit_id, consumed, not_before] => {
                (*version, *timestamp, *commit_id, *consumed, *not_before, NONE_MARK)
            }
            [version, timestamp, commit_id, consumed, not_before, recent] => {
                (*version, *timestamp, *commit_id, *consumed, *not_before, *recent)
            }
            _ => return Err(invalid("expected 5 or 6 fields")),
        };
        if version != TOKEN_VERSION {
            return Err(invalid("unsupported version"));
        }

        let parse_key = |timestamp: &str, commit_id: &str| -> Result<CommitKey, EventStoreError> {
            let micros: i64 = timestamp.parse().map_err(|_| invalid("bad commit timestamp"))?;
            let timestamp =
                DateTime::from_timestamp_micros(micros).ok_or_else(|| invalid("commit timestamp out of range"))?;
            let commit_id = Uuid::parse_str(commit_id).map_err(|_| invalid("bad commit id"))?;
            Ok(CommitKey::new(timestamp, commit_id))
        };

        let position = match (timestamp, commit_id) {
            (NONE_MARK, NONE_MARK) => None,
            (timestamp, commit_id) => Some(parse_key(timestamp, commit_id)?),
        };

        let consumed: u32 = consumed.parse().map_err(|_| invalid("bad consumed count"))?;

        let not_before = match not_before {
            NONE_MARK => None,
            value => {
                let micros: i64 = value.parse().map_err(|_| invalid("bad lower bound"))?;
                Some(DateTime::from_timestamp_micros(micros).ok_or_else(|| invalid("lower bound out of range"))?)
            }
        };

        let mut recent_commits = Vec::new();
        if recent != NONE_MARK {
            for entry in recent.split(RECENT_SEPARATOR) {
                let fields: Vec<&str> = entry.split(ENTRY_SEPARATOR).collect();
                let [timestamp, commit_id, consumed] = fields.as_slice() else {
                    return Err(invalid("bad look-back entry"));
                };
                let consumed: u32 = consumed.parse().map_err(|_| invalid("bad look-back consumed count"))?;
                recent_commits.push((parse_key(timestamp, commit_id)?, consumed));
            }
            recent_commits.sort();
        }

        Ok(Self {
            position,
            consumed,
            recent: recent_commits,
            not_before,
        })
    }
}

impl Default for TrackingToken {
    fn default() -> Self {
        Self::tail()
    }
}

impl fmt::Display for TrackingToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

impl FromStr for TrackingToken {
    type Err = EventStoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::decode(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, SubsecRound, TimeZone};

    fn key(seconds: i64) -> CommitKey {
        CommitKey::new(Utc.timestamp_opt(1_700_000_000 + seconds, 0).unwrap(), Uuid::now_v7())
    }

    #[test]
    fn test_tokens_order_by_commit_then_offset() {
        let first = key(0);
        let second = key(1);

        assert!(TrackingToken::tail() < TrackingToken::before(first));
        assert!(TrackingToken::before(first) < TrackingToken::after_offset(first, 0));
        assert!(TrackingToken::after_offset(first, 0) < TrackingToken::after_offset(first, 1));
        assert!(TrackingToken::after_commit(first, 3) < TrackingToken::before(second));
    }

    #[test]
    fn test_same_timestamp_ties_break_on_commit_id() {
        let at = Utc::now();
        let a = CommitKey::new(at, Uuid::now_v7());
        let b = CommitKey::new(at, Uuid::now_v7());
        assert!(a < b);
    }

    #[test]
    fn test_is_before_mid_commit() {
        let k = key(0);
        let token = TrackingToken::after_offset(k, 1);

        assert!(!token.is_before(&k, 0));
        assert!(!token.is_before(&k, 1));
        assert!(token.is_before(&k, 2));
        assert!(token.is_before(&key(5), 0));
        assert!(TrackingToken::tail().is_before(&k, 0));
    }

    #[test]
    fn test_lower_bound_admits() {
        let bound = Utc::now();
        let token = TrackingToken::tail().with_lower_bound(Some(bound));

        assert!(token.admits(bound));
        assert!(token.admits(bound + Duration::seconds(1)));
        assert!(!token.admits(bound - Duration::seconds(1)));
        assert!(TrackingToken::tail().admits(bound - Duration::days(365)));
    }

    #[test]
    fn test_external_form_roundtrip() {
        let bound = Utc::now().trunc_subsecs(6);
        let token = TrackingToken::after_offset(key(42), 4).with_lower_bound(Some(bound));
        let decoded: TrackingToken = token.encode().parse().unwrap();
        assert_eq!(decoded, token);

        let tail = TrackingToken::tail();
        assert_eq!(TrackingToken::decode(&tail.encode()).unwrap(), tail);
    }

    #[test]
    fn test_late_commit_inside_look_back_is_pending() {
        let window = Duration::seconds(5);
        let late = key(8);
        let seen = key(9);
        let ancient = key(1);
        let token = TrackingToken::tail()
            .advanced(seen, 2, window)
            .advanced(key(10), 1, window);

        // Without a window only later commits count
        assert!(!token.is_pending(&late, 0, Duration::zero()));
        assert!(token.is_pending(&late, 0, window));
        assert!(!token.is_pending(&seen, 1, window));
        assert!(!token.is_pending(&ancient, 0, window));

        // Delivering the late commit keeps the position and remembers it
        let after_late = token.advanced(late, 1, window);
        assert_eq!(after_late.position(), token.position());
        assert_eq!(after_late.consumed(), 1);
        assert!(!after_late.is_pending(&late, 0, window));
        assert!(after_late.is_pending(&late, 1, window));
    }

    #[test]
    fn test_look_back_entries_expire() {
        let window = Duration::seconds(5);
        let token = TrackingToken::tail()
            .advanced(key(0), 1, window)
            .advanced(key(3), 1, window);
        assert_eq!(token.recent().len(), 1);

        let moved_on = token.advanced(key(20), 1, window);
        assert!(moved_on.recent().is_empty());

        let no_window = TrackingToken::tail()
            .advanced(key(0), 1, Duration::zero())
            .advanced(key(1), 1, Duration::zero());
        assert_eq!(no_window, TrackingToken::after_commit(no_window.position().copied().unwrap(), 1));
    }

    #[test]
    fn test_external_form_keeps_look_back_window() {
        let window = Duration::seconds(5);
        let token = TrackingToken::tail()
            .advanced(key(1), 3, window)
            .advanced(key(4), 1, window)
            .advanced(key(2), 2, window);
        assert_eq!(token.recent().len(), 2);

        let decoded = TrackingToken::decode(&token.encode()).unwrap();
        assert_eq!(decoded, token);

        // Older 5-field form still decodes
        let legacy = TrackingToken::decode("v1:-:-:0:-").unwrap();
        assert_eq!(legacy, TrackingToken::tail());
    }

    #[test]
    fn test_malformed_external_form() {
        for bad in ["", "v1:1:2", "v2:-:-:0:-", "v1:abc:-:0:-", "v1:-:-:x:-", "v1:-:-:0:-:1.2"] {
            assert!(
                matches!(TrackingToken::decode(bad), Err(EventStoreError::InvalidToken(_))),
                "expected '{}' to be rejected",
                bad
            );
        }
    }
}
