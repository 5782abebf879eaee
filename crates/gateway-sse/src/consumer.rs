//! `SseDecoder`: the line-oriented SSE wire parser.
//!
//! Small pure functions, one `#[test]` per wire-format edge case, and
//! `proptest` for the chunk-boundary invariance.

use serde::{Deserialize, Serialize};

/// One parsed SSE record: the accumulated fields of one empty-line-terminated
/// block.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SseRecord {
    pub event_type: String,
    pub data: String,
    pub id: Option<String>,
    pub retry: Option<u64>,
}

/// The typed events an SSE stream for a model completion carries. Decoded
/// from `SseRecord.data` once `event_type` identifies which shape to expect.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    Chunk { delta: String },
    ToolCall { fragment: String },
    Usage {
        prompt_tokens: u64,
        completion_tokens: u64,
        #[serde(default)]
        reasoning_tokens: u64,
    },
    Done { finish_reason: String },
    Error { code: String, message: String },
}

#[derive(Default)]
struct PendingRecord {
    event_type: Option<String>,
    data_lines: Vec<String>,
    id: Option<String>,
    retry: Option<u64>,
    has_field: bool,
}

impl PendingRecord {
    fn finalize(self) -> SseRecord {
        SseRecord {
            event_type: self.event_type.unwrap_or_else(|| "message".to_string()),
            data: self.data_lines.join("\n"),
            id: self.id,
            retry: self.retry,
        }
    }
}

/// Stateful decoder: buffers incomplete trailing lines across byte-chunk
/// boundaries (cross-chunk reassembly).
#[derive(Default)]
pub struct SseDecoder {
    buf: Vec<u8>,
    pending: PendingRecord,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed the next chunk of bytes; returns every record completed (closed
    /// by a blank line) inside this call, in order. A trailing lone `\r` is
    /// held back — it may be the first half of a `\r\n` split across the
    /// next chunk boundary.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<SseRecord> {
        self.buf.extend_from_slice(bytes);
        let mut out = Vec::new();
        while let Some((end, term_len)) = find_line_end(&self.buf, false) {
            let line = self.buf[..end].to_vec();
            self.buf.drain(..end + term_len);
            if let Some(record) = self.feed_line(&line) {
                out.push(record);
            }
        }
        out
    }

    /// Call once the underlying byte stream has ended. Drains every
    /// remaining line — including one closed only by a trailing `\r` that
    /// `push` was holding back — then treats any true leftover (content with
    /// no terminator at all) as a final line, and finally emits the pending
    /// record if one never saw its closing blank line.
    pub fn flush(&mut self) -> Vec<SseRecord> {
        let mut out = Vec::new();
        while let Some((end, term_len)) = find_line_end(&self.buf, true) {
            let line = self.buf[..end].to_vec();
            self.buf.drain(..end + term_len);
            if let Some(record) = self.feed_line(&line) {
                out.push(record);
            }
        }
        if !self.buf.is_empty() {
            let line = std::mem::take(&mut self.buf);
            if let Some(record) = self.feed_line(&line) {
                out.push(record);
            }
        }
        if self.pending.has_field {
            let pending = std::mem::take(&mut self.pending);
            out.push(pending.finalize());
        }
        out
    }

    fn feed_line(&mut self, line: &[u8]) -> Option<SseRecord> {
        if line.is_empty() {
            if self.pending.has_field {
                let pending = std::mem::take(&mut self.pending);
                return Some(pending.finalize());
            }
            return None;
        }

        let line = String::from_utf8_lossy(line);
        if line.starts_with(':') {
            return None; // comment
        }

        let (field, raw_value) = match line.find(':') {
            Some(idx) => (&line[..idx], &line[idx + 1..]),
            None => (line.as_ref(), ""),
        };
        let value = raw_value.strip_prefix(' ').unwrap_or(raw_value);

        match field {
            "event" => {
                self.pending.event_type = Some(value.to_string());
                self.pending.has_field = true;
            }
            "data" => {
                self.pending.data_lines.push(value.to_string());
                self.pending.has_field = true;
            }
            "id" => {
                if !value.contains('\0') {
                    self.pending.id = Some(value.to_string());
                    self.pending.has_field = true;
                }
            }
            "retry" => {
                if let Ok(ms) = value.parse::<u64>() {
                    self.pending.retry = Some(ms);
                    self.pending.has_field = true;
                }
            }
            _ => {}
        }
        None
    }
}

/// Decodes `record.data` as a `StreamEvent` per `record.event_type`,
/// returning `None` for an unrecognized event type or malformed payload
/// rather than failing the whole stream.
pub fn decode_event(record: &SseRecord) -> Option<StreamEvent> {
    let mut payload: serde_json::Value = serde_json::from_str(&record.data).ok()?;
    let map = payload.as_object_mut()?;
    map.insert("type".to_string(), serde_json::Value::String(record.event_type.clone()));
    serde_json::from_value(payload).ok()
}

/// Finds the end of the next complete line in `buf`, returning
/// `(content_end, terminator_len)`. A lone trailing `\r` is ambiguous — it
/// might be the first half of a `\r\n` split across chunks — so it's only
/// treated as a complete terminator once `eof` confirms no more bytes are
/// coming.
fn find_line_end(buf: &[u8], eof: bool) -> Option<(usize, usize)> {
    for i in 0..buf.len() {
        match buf[i] {
            b'\n' => return Some((i, 1)),
            b'\r' => {
                if i + 1 < buf.len() {
                    if buf[i + 1] == b'\n' {
                        return Some((i, 2));
                    }
                    return Some((i, 1));
                }
                return if eof { Some((i, 1)) } else { None };
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simple_record_terminated_by_blank_line() {
        let mut dec = SseDecoder::new();
        let records = dec.push(b"event: chunk\ndata: hello\n\n");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].event_type, "chunk");
        assert_eq!(records[0].data, "hello");
    }

    #[test]
    fn repeated_data_fields_join_with_newline() {
        let mut dec = SseDecoder::new();
        let records = dec.push(b"data: line one\ndata: line two\n\n");
        assert_eq!(records[0].data, "line one\nline two");
    }

    #[test]
    fn cr_lf_and_bare_cr_line_endings_are_equivalent() {
        for terminator in [&b"\n"[..], b"\r\n", b"\r"] {
            let mut dec = SseDecoder::new();
            let mut input = Vec::new();
            input.extend_from_slice(b"data: x");
            input.extend_from_slice(terminator);
            input.extend_from_slice(terminator);
            let mut records = dec.push(&input);
            // A lone trailing `\r` terminator is held back by `push` until
            // `flush` (or more bytes) confirms it isn't half of a `\r\n`.
            records.extend(dec.flush());
            assert_eq!(records.len(), 1, "terminator {terminator:?}");
            assert_eq!(records[0].data, "x");
        }
    }

    #[test]
    fn comment_lines_are_skipped() {
        let mut dec = SseDecoder::new();
        let records = dec.push(b": keep-alive\ndata: x\n\n");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].data, "x");
    }

    #[test]
    fn leading_single_space_after_colon_is_stripped_further_spaces_kept() {
        let mut dec = SseDecoder::new();
        let records = dec.push(b"data:  two spaces\n\n");
        assert_eq!(records[0].data, " two spaces");
    }

    #[test]
    fn id_containing_nul_is_rejected() {
        let mut dec = SseDecoder::new();
        let input = b"id: bad\0id\ndata: x\n\n".to_vec();
        let records = dec.push(&input);
        assert_eq!(records[0].id, None);
    }

    #[test]
    fn record_split_across_chunk_boundary_reassembles() {
        let mut dec = SseDecoder::new();
        assert!(dec.push(b"event: ch").is_empty());
        assert!(dec.push(b"unk\ndata: par").is_empty());
        let records = dec.push(b"tial\n\n");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].event_type, "chunk");
        assert_eq!(records[0].data, "partial");
    }

    #[test]
    fn flush_emits_pending_record_without_trailing_blank_line() {
        let mut dec = SseDecoder::new();
        assert!(dec.push(b"data: unterminated").is_empty());
        let records = dec.flush();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].data, "unterminated");
    }

    #[test]
    fn decode_event_maps_record_to_typed_event() {
        let record = SseRecord {
            event_type: "chunk".into(),
            data: r#"{"delta":"hi"}"#.into(),
            id: None,
            retry: None,
        };
        assert_eq!(decode_event(&record), Some(StreamEvent::Chunk { delta: "hi".into() }));
    }

    #[test]
    fn decode_event_returns_none_for_malformed_payload() {
        let record = SseRecord {
            event_type: "usage".into(),
            data: "not json".into(),
            id: None,
            retry: None,
        };
        assert_eq!(decode_event(&record), None);
    }

    proptest::proptest! {
        /// However an SSE byte stream is split across `push` calls, the
        /// decoded records must come out identical to feeding it in one shot
        /// — chunk boundaries are a transport accident, not part of the wire
        /// format.
        #[test]
        fn chunk_boundaries_never_change_the_decoded_records(
            data_values in proptest::collection::vec("[a-zA-Z0-9 ]{0,24}", 1..8),
            split_points in proptest::collection::vec(0usize..600, 0..12),
        ) {
            let mut full = Vec::new();
            for v in &data_values {
                full.extend_from_slice(format!("event: chunk\ndata: {v}\n\n").as_bytes());
            }

            let mut whole = SseDecoder::new();
            let mut expected = whole.push(&full);
            expected.extend(whole.flush());

            let mut points: Vec<usize> = split_points.into_iter().map(|p| p % (full.len() + 1)).collect();
            points.push(0);
            points.push(full.len());
            points.sort_unstable();
            points.dedup();

            let mut split = SseDecoder::new();
            let mut actual = Vec::new();
            let mut prev = 0;
            for p in points {
                if p > prev {
                    actual.extend(split.push(&full[prev..p]));
                    prev = p;
                }
            }
            actual.extend(split.flush());

            proptest::prop_assert_eq!(actual, expected);
        }
    }
}
