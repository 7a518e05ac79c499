//! Completion heuristic for interactive sessions.
//!
//! The CLI has no structured "done" signal, so completion is inferred from
//! the output accumulated since the last send: enough marker substrings,
//! followed by something that looks like a shell prompt.
//!
//! Known limitation: output that itself contains a marker and then a
//! prompt-like line (e.g. quoted transcripts) fires early.

use bridge_core::CompletionConfig;
use bridge_proto::BridgeError;
use regex::Regex;
use std::io::Write;
use std::sync::{Arc, Mutex, PoisonError};

/// The prompt must appear within this many trailing bytes of output.
const PROMPT_WINDOW: usize = 4096;

/// A predicate over ANSI-stripped output.
pub trait CompletionMatcher: Send + Sync {
    /// True when `output` (everything since the last send) looks finished.
    fn is_complete(&self, output: &str) -> bool;

    /// Same as [`is_complete`](Self::is_complete) for output that only grows
    /// between calls. `state` belongs to one exchange and lets a matcher
    /// skip text it has already scanned.
    fn is_complete_grown(&self, output: &str, state: &mut ScanState) -> bool {
        let _ = state;
        self.is_complete(output)
    }
}

/// Per-exchange progress of an incremental scan.
#[derive(Debug, Clone, Default)]
pub struct ScanState {
    scanned: usize,
    markers: usize,
    tail_start: usize,
    nested: Vec<ScanState>,
}

/// `required` marker occurrences, then a prompt after the last one.
#[derive(Debug, Clone)]
pub struct MarkerPromptMatcher {
    markers: Vec<String>,
    required: usize,
    prompt: Regex,
    longest_marker: usize,
}

impl MarkerPromptMatcher {
    pub fn new(markers: Vec<String>, required: usize, prompt_pattern: &str) -> Result<Self, BridgeError> {
        let prompt = Regex::new(prompt_pattern)
            .map_err(|e| BridgeError::protocol(format!("invalid prompt pattern: {e}")))?;
        let markers: Vec<String> = markers.into_iter().filter(|m| !m.is_empty()).collect();
        let longest_marker = markers.iter().map(String::len).max().unwrap_or(0);
        Ok(Self {
            markers,
            required,
            prompt,
            longest_marker,
        })
    }

    /// Counts markers ending past `state.scanned`. The rescan starts early
    /// enough to catch a marker split across two calls.
    fn count_new_markers(&self, output: &str, state: &mut ScanState) {
        if state.scanned > output.len() {
            *state = ScanState::default();
        }
        let mut from = state.scanned.saturating_sub(self.longest_marker.saturating_sub(1));
        while !output.is_char_boundary(from) {
            from -= 1;
        }

        for marker in &self.markers {
            for (start, m) in output[from..].match_indices(marker.as_str()) {
                let end = from + start + m.len();
                if end > state.scanned {
                    state.markers += 1;
                    state.tail_start = state.tail_start.max(end);
                }
            }
        }
        state.scanned = output.len();
    }
}

impl CompletionMatcher for MarkerPromptMatcher {
    fn is_complete(&self, output: &str) -> bool {
        self.is_complete_grown(output, &mut ScanState::default())
    }

    fn is_complete_grown(&self, output: &str, state: &mut ScanState) -> bool {
        self.count_new_markers(output, state);
        if state.markers < self.required {
            return false;
        }

        let mut window = output
            .len()
            .saturating_sub(PROMPT_WINDOW)
            .max(state.tail_start);
        while !output.is_char_boundary(window) {
            window += 1;
        }
        self.prompt.is_match(&output[window..])
    }
}

/// Ordered set of matchers; the first that fires wins.
#[derive(Default)]
pub struct MatcherChain {
    matchers: Vec<Box<dyn CompletionMatcher>>,
}

impl std::fmt::Debug for MatcherChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MatcherChain")
            .field("matchers", &self.matchers.len())
            .finish()
    }
}

impl MatcherChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// The default chain: a single marker-then-prompt matcher.
    pub fn from_config(config: &CompletionConfig) -> Result<Self, BridgeError> {
        let matcher = MarkerPromptMatcher::new(
            config.markers.clone(),
            config.required_markers,
            &config.prompt_pattern,
        )?;
        Ok(Self::new().with(matcher))
    }

    #[must_use]
    pub fn with(mut self, matcher: impl CompletionMatcher + 'static) -> Self {
        self.matchers.push(Box::new(matcher));
        self
    }

    pub fn len(&self) -> usize {
        self.matchers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.matchers.is_empty()
    }
}

impl CompletionMatcher for MatcherChain {
    fn is_complete(&self, output: &str) -> bool {
        self.matchers.iter().any(|m| m.is_complete(output))
    }

    fn is_complete_grown(&self, output: &str, state: &mut ScanState) -> bool {
        state
            .nested
            .resize_with(self.matchers.len(), ScanState::default);
        // Every matcher sees every call so its own state stays current
        self.matchers
            .iter()
            .zip(state.nested.iter_mut())
            .fold(false, |done, (m, nested)| m.is_complete_grown(output, nested) || done)
    }
}

/// Any closure over the output text is a matcher.
impl<F> CompletionMatcher for F
where
    F: Fn(&str) -> bool + Send + Sync,
{
    fn is_complete(&self, output: &str) -> bool {
        self(output)
    }
}

/// Strips ANSI escape sequences from raw terminal bytes.
pub fn strip_ansi(bytes: &[u8]) -> String {
    let stripped = strip_ansi_escapes::strip(bytes);
    String::from_utf8_lossy(&stripped).into_owned()
}

#[derive(Clone, Default)]
struct StrippedSink(Arc<Mutex<Vec<u8>>>);

impl StrippedSink {
    fn take(&self) -> Vec<u8> {
        std::mem::take(&mut *self.0.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

impl Write for StrippedSink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Streaming form of [`strip_ansi`]: parser state carries over between
/// chunks, so escape sequences and UTF-8 split across reads are handled.
pub struct AnsiStripper {
    writer: strip_ansi_escapes::Writer<StrippedSink>,
    sink: StrippedSink,
}

impl std::fmt::Debug for AnsiStripper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnsiStripper").finish_non_exhaustive()
    }
}

impl Default for AnsiStripper {
    fn default() -> Self {
        Self::new()
    }
}

impl AnsiStripper {
    pub fn new() -> Self {
        let sink = StrippedSink::default();
        Self {
            writer: strip_ansi_escapes::Writer::new(sink.clone()),
            sink,
        }
    }

    /// Feeds raw bytes and returns the plain text they produced.
    pub fn push(&mut self, bytes: &[u8]) -> String {
        // The sink is in memory and never fails
        let _ = self.writer.write_all(bytes);
        let _ = self.writer.flush();
        String::from_utf8_lossy(&self.sink.take()).into_owned()
    }
}
