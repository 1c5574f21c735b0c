//! Cumulative log matching across polls.

use bytes::Bytes;
use futures::{FutureExt, StreamExt};
use regex::Regex;

use crate::runtime::LogStream;
use crate::wait::probe::{ProbeContext, ProbeOutcome};

/// Counts log lines matching a pattern over the life of one wait.
///
/// Each poll drains whatever output is already available without blocking.
/// Lines are matched once; a partial trailing line waits for its newline.
/// If the stream breaks it is reopened and the bytes already seen are
/// skipped, so nothing is counted twice.
pub struct LogWatch {
    pattern: Regex,
    times: usize,
    stream: Option<LogStream>,
    partial: Vec<u8>,
    matches: usize,
    consumed: usize,
    skip: usize,
}

impl LogWatch {
    pub fn new(pattern: Regex, times: usize) -> Self {
        Self {
            pattern,
            times: times.max(1),
            stream: None,
            partial: Vec::new(),
            matches: 0,
            consumed: 0,
            skip: 0,
        }
    }

    /// Matching lines seen so far.
    pub fn matches(&self) -> usize {
        self.matches
    }

    fn satisfied(&self) -> bool {
        self.matches >= self.times
    }

    pub(crate) async fn check(&mut self, ctx: &ProbeContext<'_>) -> ProbeOutcome {
        if self.satisfied() {
            return ProbeOutcome::Ready;
        }

        let mut stream = match self.stream.take() {
            Some(stream) => stream,
            None => {
                self.skip = self.consumed;
                ctx.runtime.stream_logs(ctx.container_id)
            }
        };

        loop {
            match stream.next().now_or_never() {
                // Nothing more buffered right now.
                None => break,
                Some(Some(Ok(chunk))) => {
                    self.feed(chunk);
                    if self.satisfied() {
                        break;
                    }
                }
                Some(Some(Err(e))) => {
                    if e.is_unrecoverable() {
                        return ProbeOutcome::Fatal(e.to_string());
                    }
                    // Dropped; reopened on the next poll.
                    return ProbeOutcome::Failed(format!("log stream: {}", e));
                }
                Some(None) => {
                    self.flush();
                    if self.satisfied() {
                        return ProbeOutcome::Ready;
                    }
                    return ProbeOutcome::Fatal(format!(
                        "log stream ended after {} of {} matches for /{}/",
                        self.matches, self.times, self.pattern
                    ));
                }
            }
        }

        self.stream = Some(stream);
        if self.satisfied() {
            ProbeOutcome::Ready
        } else {
            ProbeOutcome::NotReady(format!("{} of {} matches", self.matches, self.times))
        }
    }

    fn feed(&mut self, chunk: Bytes) {
        let mut data: &[u8] = &chunk;
        if self.skip > 0 {
            let n = self.skip.min(data.len());
            data = &data[n..];
            self.skip -= n;
        }
        self.consumed += data.len();
        self.partial.extend_from_slice(data);

        while let Some(pos) = self.partial.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.partial.drain(..=pos).collect();
            self.match_line(&line[..line.len() - 1]);
        }
    }

    fn flush(&mut self) {
        if !self.partial.is_empty() {
            let line = std::mem::take(&mut self.partial);
            self.match_line(&line);
        }
    }

    fn match_line(&mut self, line: &[u8]) {
        let text = String::from_utf8_lossy(line);
        let text = text.trim_end_matches('\r');
        if self.pattern.is_match(text) {
            self.matches += 1;
            tracing::debug!(
                "Log line matched /{}/ ({} of {}): {}",
                self.pattern,
                self.matches,
                self.times,
                text
            );
        }
    }
}

impl std::fmt::Debug for LogWatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogWatch")
            .field("pattern", &self.pattern.as_str())
            .field("times", &self.times)
            .field("matches", &self.matches)
            .field("consumed", &self.consumed)
            .finish_non_exhaustive()
    }
}
