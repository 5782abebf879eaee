//! `EventLog`: the append-only, CRC-guarded WAL substrate.
//!
//! One tree (`events`) holds the records, keyed so that iteration order
//! equals sequence order within a stream; a second tree (`sequences`) holds
//! the atomically-incremented per-stream counter. Both trees are mutated
//! inside a single `sled::Transaction` so sequence assignment and the insert
//! it authorizes can never be observed apart.

use std::sync::atomic::{AtomicBool, Ordering};

use serde_json::Value;
use sled::transaction::{ConflictableTransactionError, TransactionError, Transactional};
use tracing::warn;

use gateway_core::error::GatewayError;
use gateway_core::transaction::{EventRecord, EVENT_SCHEMA_VERSION};
use gateway_core::types::{CorrelationId, Cursor, FencingToken, Sequence, StreamName, TimestampMs};
use gateway_leader::LeaderLock;

/// Default page size for `replay` batches.
pub const DEFAULT_REPLAY_PAGE: usize = 500;

/// The append-only event log. One instance owns one sled database.
/// `append` refuses to run unless the caller presents a fencing token that
/// `LeaderLock::validate` accepts at the moment of the call — the log
/// enforces single-writer discipline itself rather than trusting the caller.
pub struct EventLog {
    events: sled::Tree,
    sequences: sled::Tree,
    closed: AtomicBool,
}

impl EventLog {
    pub fn open<P: AsRef<std::path::Path>>(path: P) -> Result<Self, GatewayError> {
        let db = sled::open(path)?;
        let events = db.open_tree("events")?;
        let sequences = db.open_tree("sequences")?;
        Ok(Self {
            events,
            sequences,
            closed: AtomicBool::new(false),
        })
    }

    /// In-memory variant for tests (`sled::Config::temporary`).
    pub fn open_temporary() -> Result<Self, GatewayError> {
        let db = sled::Config::new().temporary(true).open()?;
        let events = db.open_tree("events")?;
        let sequences = db.open_tree("sequences")?;
        Ok(Self {
            events,
            sequences,
            closed: AtomicBool::new(false),
        })
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    /// Validates `fencing_token` against `leader`, atomically assigns the
    /// next sequence number for `stream`, computes the CRC32 checksum of
    /// `payload`, and persists the record. Returns
    /// `GatewayError::InvalidFencingToken` without writing anything if the
    /// token no longer matches the current leader's.
    #[allow(clippy::too_many_arguments)]
    pub fn append(
        &self,
        stream: &StreamName,
        event_type: &str,
        payload: Value,
        correlation_id: CorrelationId,
        now: TimestampMs,
        leader: &LeaderLock,
        fencing_token: FencingToken,
    ) -> Result<EventRecord, GatewayError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(GatewayError::LogClosed);
        }
        if !leader.validate(fencing_token) {
            return Err(GatewayError::InvalidFencingToken);
        }

        let checksum = gateway_core::compute_checksum(&payload);
        let seq_key = stream.as_str().as_bytes().to_vec();
        let stream_owned = stream.clone();
        let event_type_owned = event_type.to_string();

        let record = (&self.sequences, &self.events)
            .transaction(move |(sequences, events)| {
                let current = sequences
                    .get(&seq_key)?
                    .map(|ivec| be_u64(&ivec))
                    .unwrap_or(0);
                let next = current.checked_add(1).ok_or_else(|| {
                    ConflictableTransactionError::Abort(GatewayError::CapacityExhausted(
                        stream_owned.to_string(),
                    ))
                })?;

                let record = EventRecord {
                    schema_version: EVENT_SCHEMA_VERSION,
                    event_type: event_type_owned.clone(),
                    stream: stream_owned.clone(),
                    sequence: next,
                    timestamp: now,
                    correlation_id: correlation_id.clone(),
                    payload: payload.clone(),
                    checksum: checksum.clone(),
                };

                let bytes = bincode::serialize(&record).map_err(|e| {
                    ConflictableTransactionError::Abort(GatewayError::Serialization(e.to_string()))
                })?;

                sequences.insert(seq_key.as_slice(), &next.to_be_bytes())?;
                events.insert(event_key(&stream_owned, next), bytes)?;
                Ok(record)
            })
            .map_err(|e: TransactionError<GatewayError>| match e {
                TransactionError::Abort(inner) => inner,
                TransactionError::Storage(e) => GatewayError::Storage(e.to_string()),
            })?;

        Ok(record)
    }

    /// The last assigned sequence for `stream`, or 0 if the stream is empty.
    pub fn latest_sequence(&self, stream: &StreamName) -> Sequence {
        self.sequences
            .get(stream.as_str().as_bytes())
            .ok()
            .flatten()
            .map(|ivec| be_u64(&ivec))
            .unwrap_or(0)
    }

    /// Yields records with `sequence > cursor.last_sequence`, in ascending
    /// order, skipping (with a warning) any record whose stored checksum no
    /// longer matches its payload. A break in the sequence between two
    /// yielded records — one the WAL itself should never produce — surfaces
    /// as `Err(GatewayError::SequenceGap)` rather than being silently
    /// skipped over. Bounded to `DEFAULT_REPLAY_PAGE` per underlying sled
    /// page by virtue of the iterator being driven lazily — callers that
    /// want true pagination should `take(DEFAULT_REPLAY_PAGE)`.
    pub fn replay(&self, stream: &StreamName, cursor: Option<Cursor>) -> ReplayIter {
        let start = cursor.map(|c| c.last_sequence).unwrap_or(0);
        let lower = event_key(stream, start.saturating_add(1));
        let prefix = stream_prefix(stream);
        ReplayIter {
            inner: self.events.range(lower..),
            prefix,
            stream: stream.clone(),
            last_sequence: start,
            done: false,
        }
    }
}

/// Lazy forward iterator over `EventLog::replay`. Stops as soon as a key no
/// longer shares the stream's prefix (sled orders all keys globally, so
/// crossing into another stream's records means this stream is exhausted).
pub struct ReplayIter {
    inner: sled::Iter,
    prefix: Vec<u8>,
    stream: StreamName,
    last_sequence: Sequence,
    done: bool,
}

impl Iterator for ReplayIter {
    type Item = Result<EventRecord, GatewayError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        loop {
            let (key, value) = match self.inner.next()? {
                Ok(kv) => kv,
                Err(e) => {
                    warn!(error = %e, "event log iterator error, stopping replay");
                    self.done = true;
                    return None;
                }
            };
            if !key.starts_with(&self.prefix) {
                self.done = true;
                return None;
            }
            match bincode::deserialize::<EventRecord>(&value) {
                Ok(record) if record.checksum_valid() => {
                    let expected = self.last_sequence + 1;
                    if record.sequence != expected {
                        self.done = true;
                        return Some(Err(GatewayError::SequenceGap {
                            stream: self.stream.to_string(),
                            expected,
                            got: record.sequence,
                        }));
                    }
                    self.last_sequence = record.sequence;
                    return Some(Ok(record));
                }
                Ok(record) => {
                    warn!(
                        stream = %record.stream,
                        sequence = record.sequence,
                        "CRC mismatch on replay, skipping record"
                    );
                    continue;
                }
                Err(e) => {
                    warn!(error = %e, "undeserializable event record, skipping");
                    continue;
                }
            }
        }
    }
}

fn stream_prefix(stream: &StreamName) -> Vec<u8> {
    let name = stream.as_str().as_bytes();
    let mut key = Vec::with_capacity(2 + name.len());
    key.extend_from_slice(&(name.len() as u16).to_be_bytes());
    key.extend_from_slice(name);
    key
}

fn event_key(stream: &StreamName, sequence: Sequence) -> Vec<u8> {
    let mut key = stream_prefix(stream);
    key.extend_from_slice(&sequence.to_be_bytes());
    key
}

fn be_u64(ivec: &sled::IVec) -> u64 {
    let mut buf = [0u8; 8];
    let len = ivec.len().min(8);
    buf[8 - len..].copy_from_slice(&ivec[ivec.len() - len..]);
    u64::from_be_bytes(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn log() -> EventLog {
        EventLog::open_temporary().unwrap()
    }

    /// Every test needs a validated `(LeaderLock, FencingToken)` pair to pass
    /// into `append`; this is the one leader these tests ever exercise.
    fn leader() -> (LeaderLock, FencingToken) {
        let tree = sled::Config::new().temporary(true).open().unwrap().open_tree("leader").unwrap();
        let lock = LeaderLock::new(tree, "test-node");
        let outcome = lock.acquire(0).unwrap();
        (lock, outcome.fencing_token)
    }

    #[test]
    fn append_assigns_monotonic_sequences() {
        let log = log();
        let (leader, token) = leader();
        let stream = StreamName::new("billing");
        let r1 = log
            .append(&stream, "billing_reserve", json!({"a": 1}), "c1".into(), 100, &leader, token)
            .unwrap();
        let r2 = log
            .append(&stream, "billing_commit", json!({"a": 2}), "c1".into(), 101, &leader, token)
            .unwrap();
        assert_eq!(r1.sequence, 1);
        assert_eq!(r2.sequence, 2);
        assert_eq!(log.latest_sequence(&stream), 2);
    }

    #[test]
    fn append_rejects_a_stale_fencing_token() {
        let log = log();
        let (leader, stale_token) = leader();
        let stream = StreamName::new("billing");

        // Lost leadership (lease expired and never renewed, or an explicit
        // step-down): `validate` now rejects the token this holder was
        // granted, and `append` must refuse to write.
        leader.release().unwrap();
        let err = log
            .append(&stream, "t", json!({}), "c".into(), 0, &leader, stale_token)
            .unwrap_err();
        assert_eq!(err.kind(), gateway_core::error::ErrorKind::Fatal);
        assert!(matches!(err, GatewayError::InvalidFencingToken));
    }

    #[test]
    fn replay_yields_records_after_cursor_in_order() {
        let log = log();
        let (leader, token) = leader();
        let stream = StreamName::new("billing");
        for i in 0..5 {
            log.append(&stream, "tick", json!({"i": i}), "c".into(), i, &leader, token)
                .unwrap();
        }
        let cursor = Cursor {
            stream: stream.clone(),
            last_sequence: 2,
        };
        let tail: Vec<_> = log.replay(&stream, Some(cursor)).collect::<Result<Vec<_>, _>>().unwrap();
        assert_eq!(tail.len(), 3);
        let mut prev = 2;
        for r in &tail {
            assert_eq!(r.sequence, prev + 1);
            prev = r.sequence;
        }
    }

    #[test]
    fn replay_does_not_cross_streams() {
        let log = log();
        let (leader, token) = leader();
        let a = StreamName::new("billing");
        let b = StreamName::new("billing-extra");
        log.append(&a, "t", json!({}), "c".into(), 0, &leader, token).unwrap();
        log.append(&b, "t", json!({}), "c".into(), 0, &leader, token).unwrap();
        log.append(&a, "t", json!({}), "c".into(), 1, &leader, token).unwrap();
        let all_a: Vec<_> = log.replay(&a, None).collect::<Result<Vec<_>, _>>().unwrap();
        assert_eq!(all_a.len(), 2);
        assert!(all_a.iter().all(|r| r.stream.as_str() == "billing"));
    }

    #[test]
    fn append_rejects_after_close() {
        let log = log();
        let (leader, token) = leader();
        log.close();
        let stream = StreamName::new("billing");
        let err = log
            .append(&stream, "t", json!({}), "c".into(), 0, &leader, token)
            .unwrap_err();
        assert_eq!(err.kind(), gateway_core::error::ErrorKind::Fatal);
    }

    #[test]
    fn corrupt_record_is_skipped_not_fatal() {
        let log = log();
        let (leader, token) = leader();
        let stream = StreamName::new("billing");
        log.append(&stream, "t", json!({"x": 1}), "c".into(), 0, &leader, token)
            .unwrap();
        log.append(&stream, "t", json!({"x": 2}), "c".into(), 1, &leader, token)
            .unwrap();

        // Corrupt the first record's stored bytes directly.
        let key = event_key(&stream, 1);
        let mut raw = log.events.get(&key).unwrap().unwrap().to_vec();
        let mut record: EventRecord = bincode::deserialize(&raw).unwrap();
        record.checksum = "ffffffff".to_string();
        raw = bincode::serialize(&record).unwrap();
        log.events.insert(key, raw).unwrap();

        let all: Vec<_> = log.replay(&stream, None).collect::<Result<Vec<_>, _>>().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].sequence, 2);
    }

    #[test]
    fn replay_reports_a_sequence_gap_instead_of_skipping_past_it() {
        let log = log();
        let (leader, token) = leader();
        let stream = StreamName::new("billing");
        log.append(&stream, "t", json!({"x": 1}), "c".into(), 0, &leader, token).unwrap();
        log.append(&stream, "t", json!({"x": 2}), "c".into(), 1, &leader, token).unwrap();
        log.append(&stream, "t", json!({"x": 3}), "c".into(), 2, &leader, token).unwrap();

        // Delete the middle record outright, producing a real gap (distinct
        // from a CRC mismatch, which the decoder would instead skip over).
        let key = event_key(&stream, 2);
        log.events.remove(key).unwrap();

        let results: Vec<_> = log.replay(&stream, None).collect();
        assert_eq!(results.len(), 2);
        assert!(results[0].as_ref().unwrap().sequence == 1);
        let err = results[1].as_ref().unwrap_err();
        assert_eq!(err.kind(), gateway_core::error::ErrorKind::Fatal);
        match err {
            GatewayError::SequenceGap { expected, got, .. } => {
                assert_eq!(*expected, 2);
                assert_eq!(*got, 3);
            }
            other => panic!("expected SequenceGap, got {other:?}"),
        }
    }
}
