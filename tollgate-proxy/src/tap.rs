//! Usage capture on server-sent-event streams.
//!
//! [`UsageTap`] wraps an upstream SSE byte stream and yields every chunk
//! unmodified. A chunk is only inspected on the poll after the one that
//! handed it downstream, so the tap never sits between the runtime and the
//! client. The last `usage` object seen in any `data:` payload is reported
//! through [`TapCompletion`] when the upstream ends.

use std::future::Future;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use bytes::Bytes;
use futures::Stream;
use pin_project_lite::pin_project;
use tokio::sync::oneshot;
use tollgate_core::TokenUsage;
use tracing::trace;

use crate::types::openai::UsageEnvelope;

/// Largest undelimited tail kept while waiting for an event's blank line
pub const MAX_EVENT_BYTES: usize = 1024 * 1024;

/// Incremental SSE decoder that keeps only the latest usage object.
///
/// Events are separated by a blank line; `\n` and `\r\n` line endings are
/// both accepted. Bytes are buffered until an event is complete, so multi
/// byte characters split across chunks decode correctly. Each byte is
/// scanned once however the event is chunked. An event that grows past
/// [`MAX_EVENT_BYTES`] without ending is discarded.
#[derive(Debug, Default)]
pub struct SseUsageParser {
    buffer: Vec<u8>,
    /// Start of the event being assembled
    pos: usize,
    /// Next byte to scan
    scan: usize,
    /// Start of the line containing `scan`
    line_start: usize,
    /// The current event overflowed and is being skipped
    oversized: bool,
    usage: Option<TokenUsage>,
}

impl SseUsageParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Latest usage seen so far
    pub fn usage(&self) -> Option<TokenUsage> {
        self.usage
    }

    /// Append a chunk and process every event it completes
    pub fn feed(&mut self, chunk: &[u8]) {
        if self.pos > 0 && self.pos == self.buffer.len() {
            self.reset_buffer();
        }
        self.buffer.extend_from_slice(chunk);

        while let Some((end, next)) = self.next_event() {
            let start = self.pos;
            self.pos = next;
            if std::mem::take(&mut self.oversized) {
                continue;
            }
            self.handle_event(start, end);
        }

        let pending = self.buffer.len() - self.pos;
        if pending > MAX_EVENT_BYTES {
            trace!(bytes = pending, "Dropping oversized stream event");
            self.reset_buffer();
            self.oversized = true;
        } else if self.pos > 4096 && self.pos > self.buffer.len() / 2 {
            let consumed = self.pos;
            self.buffer.drain(..consumed);
            self.pos = 0;
            self.scan -= consumed;
            self.line_start -= consumed;
        }
    }

    /// Process a trailing event that never got its blank line
    pub fn finish(&mut self) -> Option<TokenUsage> {
        if self.pos < self.buffer.len() && !self.oversized {
            let (start, end) = (self.pos, self.buffer.len());
            self.handle_event(start, end);
        }
        self.reset_buffer();
        self.usage
    }

    fn reset_buffer(&mut self) {
        self.buffer.clear();
        self.pos = 0;
        self.scan = 0;
        self.line_start = 0;
    }

    /// Resume scanning for the blank line ending the current event.
    /// Returns the event's end offset and the offset just past the separator.
    fn next_event(&mut self) -> Option<(usize, usize)> {
        while self.scan < self.buffer.len() {
            let byte = self.buffer[self.scan];
            self.scan += 1;
            if byte != b'\n' {
                continue;
            }

            let line = &self.buffer[self.line_start..self.scan - 1];
            let blank = line.is_empty() || line == b"\r";
            let line_start = std::mem::replace(&mut self.line_start, self.scan);
            if blank {
                return Some((line_start, self.scan));
            }
        }
        None
    }

    fn handle_event(&mut self, start: usize, end: usize) {
        let Some(payload) = data_payload(&self.buffer[start..end]) else {
            return;
        };
        if std::str::from_utf8(&payload).map(str::trim) == Ok("[DONE]") {
            return;
        }

        match serde_json::from_slice::<UsageEnvelope>(&payload) {
            Ok(UsageEnvelope { usage: Some(usage) }) => {
                trace!(total_tokens = usage.total_tokens, "Captured stream usage");
                self.usage = Some(usage);
            }
            Ok(_) => {}
            Err(e) => trace!(error = %e, "Skipping unparseable stream event"),
        }
    }
}

/// Join the `data:` lines of one event; `None` if it has none
fn data_payload(event: &[u8]) -> Option<Vec<u8>> {
    let mut payload: Option<Vec<u8>> = None;

    for line in event.split(|b| *b == b'\n') {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        let Some(value) = line.strip_prefix(b"data:") else {
            continue;
        };
        let value = value.strip_prefix(b" ").unwrap_or(value);

        match payload.as_mut() {
            Some(joined) => {
                joined.push(b'\n');
                joined.extend_from_slice(value);
            }
            None => payload = Some(value.to_vec()),
        }
    }

    payload
}

pin_project! {
    /// Passthrough stream that records usage as a side effect
    pub struct UsageTap<S> {
        #[pin]
        inner: S,
        parser: SseUsageParser,
        pending: Option<Bytes>,
        done: Option<oneshot::Sender<Option<TokenUsage>>>,
    }
}

/// Wrap `inner`. The returned future resolves with the captured usage once
/// the stream ends, or with `None` if the tap is dropped first.
pub fn tap<S>(inner: S) -> (UsageTap<S>, TapCompletion) {
    let (tx, rx) = oneshot::channel();
    let tap = UsageTap { inner, parser: SseUsageParser::new(), pending: None, done: Some(tx) };
    (tap, TapCompletion { rx })
}

impl<S> UsageTap<S> {
    /// Usage parsed so far (lags one chunk behind what was yielded)
    pub fn captured(&self) -> Option<TokenUsage> {
        self.parser.usage()
    }
}

impl<S, E> Stream for UsageTap<S>
where
    S: Stream<Item = Result<Bytes, E>>,
{
    type Item = Result<Bytes, E>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();

        if let Some(chunk) = this.pending.take() {
            this.parser.feed(&chunk);
        }

        if this.done.is_none() {
            return Poll::Ready(None);
        }

        match ready!(this.inner.poll_next(cx)) {
            Some(Ok(chunk)) => {
                *this.pending = Some(chunk.clone());
                Poll::Ready(Some(Ok(chunk)))
            }
            Some(Err(e)) => Poll::Ready(Some(Err(e))),
            None => {
                let usage = this.parser.finish();
                if let Some(done) = this.done.take() {
                    let _ = done.send(usage);
                }
                Poll::Ready(None)
            }
        }
    }
}

/// Resolves with the usage captured by a [`UsageTap`]
#[derive(Debug)]
pub struct TapCompletion {
    rx: oneshot::Receiver<Option<TokenUsage>>,
}

impl Future for TapCompletion {
    type Output = Option<TokenUsage>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|result| result.ok().flatten())
    }
}
