use crate::config::StreamingConfig;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// One observed content chunk. Only a bounded window is retained, trimmed
/// by both count and age.
#[derive(Debug, Clone)]
pub(crate) struct ContentChunk {
    pub content: String,
    pub at: Instant,
    pub byte_len: usize,
    pub approx_tokens: usize,
    pub index: u64,
}

/// Weighted stutter signals. Weights sum to 1.
const WEIGHT_PREFIX: f64 = 0.3;
const WEIGHT_LENGTH: f64 = 0.3;
const WEIGHT_TIMING: f64 = 0.2;
const WEIGHT_SIMILARITY: f64 = 0.2;

/// Arrivals considered by the timing signal.
const TIMING_ARRIVALS: usize = 3;

/// Classifies incoming content chunks as stutter repeats of their
/// predecessor.
///
/// Four signals in [0, 1] feed a weighted confidence:
///
/// 1. `prefix_match`: `|prev| / |cur|` when the chunk strictly extends its
///    predecessor. Near 1 for the tiny accretions of a stutter burst, low
///    when the reply jumps forward by a large suffix.
/// 2. `length_progression`: how far the recent mean chunk length still is
///    from `length_target`. Stutter bursts keep chunks tiny; normal deltas
///    drift toward full-size.
/// 3. `timing_regularity`: fraction of recent inter-arrival gaps inside
///    half the configured time window. Stutter repeats arrive back to back;
///    organic deltas pace with generation.
/// 4. `content_similarity`: common prefix over the longer length.
pub struct StutterDetector {
    window_size: usize,
    time_window: Duration,
    min_confidence: f64,
    similarity_threshold: f64,
    length_target: f64,
    history: VecDeque<ContentChunk>,
    next_index: u64,
}

impl StutterDetector {
    pub fn new(cfg: &StreamingConfig) -> Self {
        Self {
            window_size: cfg.window_size,
            time_window: cfg.time_window,
            min_confidence: cfg.min_confidence,
            similarity_threshold: cfg.similarity_threshold,
            length_target: cfg.length_target,
            history: VecDeque::with_capacity(cfg.window_size),
            next_index: 0,
        }
    }

    /// Record a chunk arrival and return the stutter confidence versus its
    /// immediate predecessor. The first chunk has no predecessor and scores
    /// full confidence (the state machine treats it as stuttering anyway).
    pub fn observe(&mut self, content: &str, at: Instant) -> f64 {
        self.trim_by_age(at);
        let confidence = match self.history.back() {
            None => 1.0,
            Some(prev) => self.confidence(prev, content, at),
        };
        self.record(content, at);
        confidence
    }

    pub fn is_stutter(&self, confidence: f64) -> bool {
        confidence >= self.min_confidence
    }

    pub fn chunks_seen(&self) -> u64 {
        self.next_index
    }

    fn confidence(&self, prev: &ContentChunk, current: &str, at: Instant) -> f64 {
        let similarity = content_similarity(&prev.content, current);
        // Near-identical successors are repeats regardless of the weighted
        // signals; this keeps long stutter chains classified even after the
        // length signal fades.
        if similarity >= self.similarity_threshold {
            return 1.0;
        }
        WEIGHT_PREFIX * prefix_match(&prev.content, current)
            + WEIGHT_LENGTH * self.length_progression()
            + WEIGHT_TIMING * self.timing_regularity(at)
            + WEIGHT_SIMILARITY * similarity
    }

    /// High while the window's mean chunk length stays well below the
    /// target, fading as chunks approach normal size.
    fn length_progression(&self) -> f64 {
        if self.history.is_empty() || self.length_target <= 0.0 {
            return 0.0;
        }
        let mean = self
            .history
            .iter()
            .map(|c| c.content.chars().count())
            .sum::<usize>() as f64
            / self.history.len() as f64;
        1.0 - (mean / self.length_target).min(1.0)
    }

    /// Fraction of the most recent inter-arrival gaps that are shorter than
    /// half the time window.
    fn timing_regularity(&self, at: Instant) -> f64 {
        let mut arrivals: Vec<Instant> = self
            .history
            .iter()
            .rev()
            .take(TIMING_ARRIVALS - 1)
            .map(|c| c.at)
            .collect();
        arrivals.reverse();
        arrivals.push(at);
        if arrivals.len() < 2 {
            return 0.0;
        }
        let threshold = self.time_window / 2;
        let gaps = arrivals.len() - 1;
        let rapid = arrivals
            .windows(2)
            .filter(|pair| pair[1].duration_since(pair[0]) <= threshold)
            .count();
        rapid as f64 / gaps as f64
    }

    fn record(&mut self, content: &str, at: Instant) {
        self.history.push_back(ContentChunk {
            content: content.to_string(),
            at,
            byte_len: content.len(),
            approx_tokens: content.len().div_ceil(4),
            index: self.next_index,
        });
        self.next_index += 1;
        while self.history.len() > self.window_size {
            self.history.pop_front();
        }
    }

    fn trim_by_age(&mut self, now: Instant) {
        while let Some(front) = self.history.front() {
            if now.duration_since(front.at) > self.time_window {
                self.history.pop_front();
            } else {
                break;
            }
        }
    }
}

/// `|prev| / |cur|` when `cur` strictly extends `prev`, else 0.
fn prefix_match(prev: &str, current: &str) -> f64 {
    if current.len() > prev.len() && current.starts_with(prev) && !prev.is_empty() {
        prev.len() as f64 / current.len() as f64
    } else {
        0.0
    }
}

/// Common prefix length over the longer of the two, in characters.
fn content_similarity(prev: &str, current: &str) -> f64 {
    let longer = prev.chars().count().max(current.chars().count());
    if longer == 0 {
        return 0.0;
    }
    common_prefix_chars(prev, current) as f64 / longer as f64
}

pub(crate) fn common_prefix_chars(a: &str, b: &str) -> usize {
    a.chars()
        .zip(b.chars())
        .take_while(|(x, y)| x == y)
        .count()
}
