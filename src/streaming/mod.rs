//! SSE stream sanitation: a resumable frame scanner, a stutter detector,
//! and the per-stream state machine that collapses prefix-repetition
//! artifacts while preserving `[DONE]` framing, finish reasons, and usage
//! accounting.

pub mod detector;
pub mod sanitizer;
pub mod scanner;

pub use detector::StutterDetector;
pub use sanitizer::{StreamPhase, StreamSanitizer};
pub use scanner::{SseFrame, SseScanner};
