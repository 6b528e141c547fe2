//! # Output Stream Framing
//!
//! Turns the container's raw stdout into publishable log lines.
//!
//! ```text
//!   bytes ──► Utf8Decoder ──► LineFramer ──► LogLines::next_event()
//!             (fallback on    (newline split,   (read / quiescence
//!              bad bytes)      idle flush,       timer select)
//!                              sentinel stop)
//! ```
//!
//! [`Utf8Decoder`] and [`LineFramer`] are pure and clock-free: the caller
//! passes `now` in. [`LogLines`] binds them to an `AsyncRead` and a tokio
//! timer and yields one [`LogEvent`] at a time.

use std::collections::VecDeque;
use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::constants::{PREDICT_SENTINEL, READ_CHUNK_SIZE, TRAIN_SENTINEL};

// =============================================================================
// Decoder
// =============================================================================

/// Incremental UTF-8 decoder that never fails.
///
/// A multibyte sequence split across two chunks is carried over to the next
/// call. Bytes that can never form valid UTF-8 are decoded with the fallback
/// (U+FFFD replacement) instead of aborting the stream.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
    fallbacks: u64,
}

impl Utf8Decoder {
    /// Creates a decoder with nothing pending.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Decodes `chunk`, prefixed with any bytes left over from the last call.
    pub fn decode(&mut self, chunk: &[u8]) -> String {
        let mut bytes = std::mem::take(&mut self.pending);
        bytes.extend_from_slice(chunk);

        let mut out = String::with_capacity(bytes.len());
        let mut input = bytes.as_slice();
        loop {
            match std::str::from_utf8(input) {
                Ok(text) => {
                    out.push_str(text);
                    break;
                }
                Err(e) => {
                    let (valid, rest) = input.split_at(e.valid_up_to());
                    out.push_str(&String::from_utf8_lossy(valid));
                    match e.error_len() {
                        Some(len) => {
                            self.fallbacks += 1;
                            out.push_str(&String::from_utf8_lossy(&rest[..len]));
                            input = &rest[len..];
                        }
                        None => {
                            // Truncated sequence at the end of the chunk.
                            self.pending = rest.to_vec();
                            break;
                        }
                    }
                }
            }
        }
        out
    }

    /// Flushes bytes still pending at end of stream.
    pub fn finish(&mut self) -> String {
        if self.pending.is_empty() {
            return String::new();
        }
        self.fallbacks += 1;
        let rest = std::mem::take(&mut self.pending);
        String::from_utf8_lossy(&rest).into_owned()
    }

    /// Number of times the fallback decode was used.
    #[must_use]
    pub fn fallbacks(&self) -> u64 {
        self.fallbacks
    }
}

// =============================================================================
// Framer
// =============================================================================

/// Lines produced by one [`LineFramer::push`].
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Framed {
    /// Complete lines, in order.
    pub lines: Vec<String>,
    /// A completion sentinel was seen; the framer accepts no more input.
    pub completed: bool,
}

/// Buffer plus flush timer.
///
/// - every `\n` flushes the complete lines before it, in order
/// - a non-empty partial line older than the quiescence window is flushed
///   as-is by [`poll_idle`](Self::poll_idle), except for a tail that could
///   still grow into a sentinel, which is held until more output arrives
/// - a sentinel anywhere in the buffer flushes what precedes it and ends
///   the stream; text after the sentinel is discarded
///
/// Blank lines are not emitted. A trailing `\r` is stripped.
#[derive(Debug)]
pub struct LineFramer {
    buffer: String,
    window: Duration,
    pending_since: Option<Instant>,
    completed: bool,
}

impl LineFramer {
    /// Creates a framer with the given quiescence window.
    #[must_use]
    pub fn new(window: Duration) -> Self {
        Self {
            buffer: String::new(),
            window,
            pending_since: None,
            completed: false,
        }
    }

    /// Returns true once a sentinel has been seen.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.completed
    }

    /// Appends decoded text received at `now`.
    pub fn push(&mut self, text: &str, now: Instant) -> Framed {
        if self.completed {
            return Framed {
                lines: Vec::new(),
                completed: true,
            };
        }

        self.buffer.push_str(text);

        if let Some(pos) = find_sentinel(&self.buffer) {
            self.buffer.truncate(pos);
            let mut lines = self.split_lines();
            lines.extend(self.take_partial());
            self.completed = true;
            self.pending_since = None;
            return Framed {
                lines,
                completed: true,
            };
        }

        let had_newline = self.buffer.contains('\n');
        let lines = self.split_lines();
        if self.buffer.is_empty() {
            self.pending_since = None;
        } else if had_newline || self.pending_since.is_none() {
            self.pending_since = Some(now);
        }

        Framed {
            lines,
            completed: false,
        }
    }

    /// When the current partial line becomes due, if there is one.
    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.pending_since.map(|since| since + self.window)
    }

    /// Flushes the partial line if it has waited a full window by `now`.
    ///
    /// A tail that is the start of a sentinel stays buffered, so a sentinel
    /// written in two pieces is still recognized.
    pub fn poll_idle(&mut self, now: Instant) -> Option<String> {
        let deadline = self.deadline()?;
        if now < deadline {
            return None;
        }
        self.pending_since = None;
        let held = sentinel_prefix_len(&self.buffer);
        let tail = self.buffer.split_off(self.buffer.len() - held);
        let partial = self.take_partial();
        self.buffer = tail;
        partial
    }

    /// Flushes whatever is buffered at end of stream.
    pub fn finish(&mut self) -> Option<String> {
        self.pending_since = None;
        self.take_partial()
    }

    fn split_lines(&mut self) -> Vec<String> {
        let Some(last_newline) = self.buffer.rfind('\n') else {
            return Vec::new();
        };
        let rest = self.buffer.split_off(last_newline + 1);
        let complete = std::mem::replace(&mut self.buffer, rest);
        complete.lines().filter_map(normalize_line).collect()
    }

    fn take_partial(&mut self) -> Option<String> {
        let partial = std::mem::take(&mut self.buffer);
        normalize_line(&partial)
    }
}

fn normalize_line(line: &str) -> Option<String> {
    let line = line.strip_suffix('\r').unwrap_or(line);
    if line.trim().is_empty() {
        None
    } else {
        Some(line.to_string())
    }
}

/// Length of the longest buffer suffix that is a proper prefix of a sentinel.
fn sentinel_prefix_len(buffer: &str) -> usize {
    [TRAIN_SENTINEL, PREDICT_SENTINEL]
        .iter()
        .filter_map(|s| (1..s.len()).rev().find(|&k| buffer.ends_with(&s[..k])))
        .max()
        .unwrap_or(0)
}

fn find_sentinel(buffer: &str) -> Option<usize> {
    [TRAIN_SENTINEL, PREDICT_SENTINEL]
        .iter()
        .filter_map(|s| buffer.find(s))
        .min()
}

// =============================================================================
// Async line source
// =============================================================================

/// One step of a container output stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogEvent {
    /// A flushed line.
    Line(String),
    /// The completion sentinel was seen.
    Completed,
    /// The stream closed without a sentinel.
    Closed,
}

enum Wake {
    Read(io::Result<usize>),
    Idle,
}

/// Pull-based line sequence over a container's stdout.
///
/// Every buffered line is yielded before the terminal event; after a
/// terminal event, further calls return it again.
pub struct LogLines<R> {
    reader: R,
    decoder: Utf8Decoder,
    framer: LineFramer,
    queue: VecDeque<String>,
    chunk: Vec<u8>,
    end: Option<LogEvent>,
}

impl<R: AsyncRead + Unpin> LogLines<R> {
    /// Wraps `reader` with the given quiescence window.
    pub fn new(reader: R, window: Duration) -> Self {
        Self {
            reader,
            decoder: Utf8Decoder::new(),
            framer: LineFramer::new(window),
            queue: VecDeque::new(),
            chunk: vec![0; READ_CHUNK_SIZE],
            end: None,
        }
    }

    /// Waits for the next line or terminal event.
    ///
    /// # Errors
    ///
    /// Returns the underlying read error. The stream should be treated as
    /// terminated afterwards.
    pub async fn next_event(&mut self) -> io::Result<LogEvent> {
        loop {
            if let Some(line) = self.queue.pop_front() {
                return Ok(LogEvent::Line(line));
            }
            if let Some(end) = &self.end {
                return Ok(end.clone());
            }

            let deadline = self.framer.deadline();
            let wake = tokio::select! {
                read = self.reader.read(&mut self.chunk) => Wake::Read(read),
                () = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => Wake::Idle,
            };

            match wake {
                Wake::Read(Ok(0)) => {
                    let tail = self.decoder.finish();
                    let framed = self.framer.push(&tail, Instant::now());
                    self.queue.extend(framed.lines);
                    if framed.completed {
                        self.end = Some(LogEvent::Completed);
                    } else {
                        self.queue.extend(self.framer.finish());
                        debug!("container output closed");
                        self.end = Some(LogEvent::Closed);
                    }
                }
                Wake::Read(Ok(n)) => {
                    trace!(bytes = n, "output chunk");
                    let text = self.decoder.decode(&self.chunk[..n]);
                    let framed = self.framer.push(&text, Instant::now());
                    self.queue.extend(framed.lines);
                    if framed.completed {
                        self.end = Some(LogEvent::Completed);
                    }
                }
                Wake::Read(Err(e)) => return Err(e),
                Wake::Idle => {
                    if let Some(partial) = self.framer.poll_idle(Instant::now()) {
                        trace!("quiescence flush");
                        self.queue.push_back(partial);
                    }
                }
            }
        }
    }

    /// Number of chunks that needed the fallback decode.
    pub fn fallback_decodes(&self) -> u64 {
        self.decoder.fallbacks()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[test]
    fn test_decoder_carries_split_sequence() {
        let mut decoder = Utf8Decoder::new();
        let bytes = "训练".as_bytes();
        let first = decoder.decode(&bytes[..2]);
        let second = decoder.decode(&bytes[2..]);
        assert_eq!(first, "");
        assert_eq!(second, "训练");
        assert_eq!(decoder.fallbacks(), 0);
    }

    #[test]
    fn test_decoder_falls_back_on_invalid_bytes() {
        let mut decoder = Utf8Decoder::new();
        let text = decoder.decode(b"loss \xff\xfe 0.3\n");
        assert!(text.starts_with("loss "));
        assert!(text.ends_with(" 0.3\n"));
        assert!(text.contains('\u{FFFD}'));
        assert!(decoder.fallbacks() > 0);
    }

    #[test]
    fn test_decoder_finish_flushes_truncated_tail() {
        let mut decoder = Utf8Decoder::new();
        assert_eq!(decoder.decode(b"ok\xe8"), "ok");
        assert_eq!(decoder.finish(), "\u{FFFD}");
        assert_eq!(decoder.finish(), "");
    }

    #[test]
    fn test_framer_splits_on_newline() {
        let mut framer = LineFramer::new(Duration::from_secs(1));
        let now = Instant::now();
        let framed = framer.push("epoch 1 done\nepoch 2 done\n", now);
        assert_eq!(framed.lines, vec!["epoch 1 done", "epoch 2 done"]);
        assert!(!framed.completed);
        assert!(framer.deadline().is_none());
    }

    #[test]
    fn test_framer_joins_partial_across_pushes() {
        let mut framer = LineFramer::new(Duration::from_secs(1));
        let now = Instant::now();
        assert!(framer.push("epo", now).lines.is_empty());
        let framed = framer.push("ch 1\r\n\n  \nepoch", now);
        assert_eq!(framed.lines, vec!["epoch 1"]);
        assert!(framer.deadline().is_some());
    }

    #[test]
    fn test_framer_idle_flush() {
        let window = Duration::from_secs(1);
        let mut framer = LineFramer::new(window);
        let start = Instant::now();
        framer.push("epoch 3...", start);

        assert_eq!(framer.deadline(), Some(start + window));
        assert_eq!(framer.poll_idle(start + Duration::from_millis(500)), None);
        assert_eq!(
            framer.poll_idle(start + window),
            Some("epoch 3...".to_string())
        );
        assert!(framer.deadline().is_none());
        assert_eq!(framer.poll_idle(start + window * 3), None);
    }

    #[test]
    fn test_framer_sentinel_discards_trailing_text() {
        let mut framer = LineFramer::new(Duration::from_secs(1));
        let now = Instant::now();
        let framed = framer.push("loss 0.1\nfinal accTRAIN_COMPLETE\nleftover\n", now);
        assert_eq!(framed.lines, vec!["loss 0.1", "final acc"]);
        assert!(framed.completed);
        assert!(framer.is_completed());

        let after = framer.push("more\n", now);
        assert!(after.lines.is_empty());
        assert_eq!(framer.finish(), None);
    }

    #[test]
    fn test_framer_sentinel_split_across_pushes() {
        let mut framer = LineFramer::new(Duration::from_secs(1));
        let now = Instant::now();
        assert!(!framer.push("PREDICT_COM", now).completed);
        let framed = framer.push("PLETE\n", now);
        assert!(framed.completed);
        assert!(framed.lines.is_empty());
    }

    #[test]
    fn test_framer_idle_flush_holds_sentinel_start() {
        let window = Duration::from_secs(1);
        let mut framer = LineFramer::new(window);
        let start = Instant::now();
        framer.push("accuracy 0.93 TRAIN_COMP", start);

        assert_eq!(
            framer.poll_idle(start + window),
            Some("accuracy 0.93 ".to_string())
        );
        assert!(framer.deadline().is_none());

        let framed = framer.push("LETE\n", start + window * 2);
        assert!(framed.completed);
        assert!(framed.lines.is_empty());
    }

    #[test]
    fn test_framer_idle_flush_of_bare_sentinel_start() {
        let window = Duration::from_secs(1);
        let mut framer = LineFramer::new(window);
        let start = Instant::now();
        framer.push("PRED", start);

        assert_eq!(framer.poll_idle(start + window), None);
        // Not a sentinel after all: flushed with the rest of the line.
        let framed = framer.push("ICTION 4\n", start + window * 2);
        assert_eq!(framed.lines, vec!["PREDICTION 4"]);
        assert!(!framed.completed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_log_lines_sentinel_split_by_quiet_period() {
        let (mut tx, rx) = tokio::io::duplex(64);
        let mut lines = LogLines::new(rx, Duration::from_secs(1));

        tx.write_all(b"done TRAIN_COMP").await.unwrap();
        assert_eq!(lines.next_event().await.unwrap(), LogEvent::Line("done ".into()));

        tokio::time::sleep(Duration::from_secs(5)).await;
        tx.write_all(b"LETE\n").await.unwrap();
        assert_eq!(lines.next_event().await.unwrap(), LogEvent::Completed);
    }

    #[tokio::test]
    async fn test_log_lines_stream() {
        let (mut tx, rx) = tokio::io::duplex(64);
        let mut lines = LogLines::new(rx, Duration::from_secs(1));

        tx.write_all(b"a\nb\nTRAIN_COMPLETE\nignored\n").await.unwrap();

        assert_eq!(lines.next_event().await.unwrap(), LogEvent::Line("a".into()));
        assert_eq!(lines.next_event().await.unwrap(), LogEvent::Line("b".into()));
        assert_eq!(lines.next_event().await.unwrap(), LogEvent::Completed);
        assert_eq!(lines.next_event().await.unwrap(), LogEvent::Completed);
    }

    #[tokio::test]
    async fn test_log_lines_eof_flushes_partial() {
        let (mut tx, rx) = tokio::io::duplex(64);
        let mut lines = LogLines::new(rx, Duration::from_secs(1));

        tx.write_all(b"last words").await.unwrap();
        drop(tx);

        assert_eq!(
            lines.next_event().await.unwrap(),
            LogEvent::Line("last words".into())
        );
        assert_eq!(lines.next_event().await.unwrap(), LogEvent::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_log_lines_quiescence() {
        let (mut tx, rx) = tokio::io::duplex(64);
        let mut lines = LogLines::new(rx, Duration::from_secs(1));

        tx.write_all(b"epoch 3...").await.unwrap();
        let started = Instant::now();
        let event = lines.next_event().await.unwrap();
        assert_eq!(event, LogEvent::Line("epoch 3...".into()));
        assert!(started.elapsed() >= Duration::from_secs(1));
        drop(tx);
        assert_eq!(lines.next_event().await.unwrap(), LogEvent::Closed);
    }
}
