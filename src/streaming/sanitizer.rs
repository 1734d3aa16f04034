use crate::config::StreamingConfig;
use crate::streaming::detector::StutterDetector;
use crate::streaming::scanner::SseFrame;
use serde_json::{Value, json};
use std::time::Instant;
use tracing::{debug, warn};

/// Per-stream phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamPhase {
    /// No content yet; non-content frames pass through.
    Initial,
    /// Accumulating prefix-repeating chunks; nothing emitted yet.
    Stuttering,
    /// Chunks forward as deltas.
    NormalFlow,
    /// A malformed frame was dropped; waiting for the next valid one.
    Recovering,
    /// `[DONE]` emitted; stream finished.
    Terminating,
}

impl std::fmt::Display for StreamPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Initial => "Initial",
            Self::Stuttering => "Stuttering",
            Self::NormalFlow => "NormalFlow",
            Self::Recovering => "Recovering",
            Self::Terminating => "Terminating",
        };
        write!(f, "{}", name)
    }
}

/// Envelope fields reused when synthesizing deltas, taken from the most
/// recent upstream chunk.
#[derive(Debug, Clone)]
struct Envelope {
    id: Value,
    created: Value,
    model: Value,
    index: Value,
}

impl Default for Envelope {
    fn default() -> Self {
        Self {
            id: Value::Null,
            created: Value::Null,
            model: Value::Null,
            index: json!(0),
        }
    }
}

/// Per-stream counters, logged when the stream ends.
#[derive(Debug, Clone)]
pub struct StreamStats {
    pub chunks_seen: u64,
    pub frames_emitted: u64,
    pub errors_seen: u32,
    pub started_at: Instant,
    pub last_valid_at: Option<Instant>,
}

/// The stateful SSE transformer.
///
/// Consumes parsed upstream frames and yields the payloads to emit to the
/// client. Pure with respect to I/O: the caller owns reading, writing, and
/// flushing, which keeps every transition unit-testable.
///
/// Guarantees on any upstream-terminated stream:
/// - exactly one trailing `[DONE]`,
/// - `finish_reason` surfaced exactly once (upstream's, or a synthesized
///   `"stop"` on a clean close without one),
/// - concatenated emitted content equals the upstream's final de-stuttered
///   content.
pub struct StreamSanitizer {
    max_errors: u32,
    detector: StutterDetector,
    phase: StreamPhase,
    /// Phase that `Recovering` resumes into.
    resume_phase: StreamPhase,
    /// In `Stuttering`: longest accepted repeat, not yet emitted.
    /// In `NormalFlow`: the previous chunk's full content.
    buffer: String,
    envelope: Envelope,
    /// finish_reason observed on a buffered content chunk, re-attached at
    /// flush time.
    pending_finish: Option<Value>,
    finish_seen: bool,
    stats: StreamStats,
}

impl StreamSanitizer {
    pub fn new(cfg: &StreamingConfig) -> Self {
        Self {
            max_errors: cfg.max_errors,
            detector: StutterDetector::new(cfg),
            phase: StreamPhase::Initial,
            resume_phase: StreamPhase::NormalFlow,
            buffer: String::new(),
            envelope: Envelope::default(),
            pending_finish: None,
            finish_seen: false,
            stats: StreamStats {
                chunks_seen: 0,
                frames_emitted: 0,
                errors_seen: 0,
                started_at: Instant::now(),
                last_valid_at: None,
            },
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.phase == StreamPhase::Terminating
    }

    pub fn stats(&self) -> &StreamStats {
        &self.stats
    }

    /// Process one upstream frame; returns payloads to write, in order.
    pub fn push(&mut self, frame: &SseFrame, at: Instant) -> Vec<String> {
        if self.phase == StreamPhase::Terminating {
            return Vec::new();
        }
        match frame {
            SseFrame::Done => self.terminate(),
            SseFrame::Data(payload) => self.push_data(payload, at),
        }
    }

    /// Upstream closed without `[DONE]`: drain buffered content and close
    /// the client stream properly anyway.
    pub fn finish(&mut self) -> Vec<String> {
        if self.phase == StreamPhase::Terminating {
            return Vec::new();
        }
        self.terminate()
    }

    fn push_data(&mut self, payload: &str, at: Instant) -> Vec<String> {
        let chunk: Value = match serde_json::from_str(payload) {
            Ok(value) => value,
            Err(e) => {
                return self.handle_error(format!("malformed JSON frame: {}", e));
            }
        };
        if !chunk.is_object() {
            return self.handle_error("frame payload is not an object".into());
        }
        if chunk.get("choices").is_some_and(|c| !c.is_array()) {
            return self.handle_error("frame choices is not an array".into());
        }

        self.stats.chunks_seen += 1;
        self.stats.last_valid_at = Some(at);
        self.update_envelope(&chunk);

        if self.phase == StreamPhase::Recovering {
            self.transition(self.resume_phase);
        }

        let finish = chunk["choices"][0]["finish_reason"].clone();
        let has_finish = !finish.is_null();
        let content = chunk["choices"][0]["delta"]["content"]
            .as_str()
            .filter(|c| !c.is_empty())
            .map(str::to_string);

        let Some(content) = content else {
            // Role/tool_call deltas, usage chunks, and bare finish frames
            // forward unchanged.
            let mut out = Vec::new();
            if has_finish {
                self.finish_seen = true;
                // A finish frame must not overtake content still held in
                // the stutter buffer.
                if self.phase == StreamPhase::Stuttering && !self.buffer.is_empty() {
                    let buffer = self.buffer.clone();
                    out.push(self.synth_delta(Some(buffer.as_str()), None));
                    self.transition(StreamPhase::NormalFlow);
                }
            }
            out.push(payload.to_string());
            self.stats.frames_emitted += out.len() as u64;
            return out;
        };

        if has_finish {
            self.pending_finish = Some(finish);
        }

        let confidence = self.detector.observe(&content, at);
        match self.phase {
            StreamPhase::Initial => {
                // The first content chunk is always treated as stuttering.
                self.buffer = content;
                self.transition(StreamPhase::Stuttering);
                Vec::new()
            }
            StreamPhase::Stuttering => self.on_stuttering(content, confidence),
            StreamPhase::NormalFlow => self.on_normal_flow(payload, content),
            StreamPhase::Recovering | StreamPhase::Terminating => unreachable!(),
        }
    }

    fn on_stuttering(&mut self, content: String, confidence: f64) -> Vec<String> {
        let repeats = content.len() >= self.buffer.len() && content.starts_with(&self.buffer);
        if repeats && self.detector.is_stutter(confidence) {
            // Still stuttering: keep only the longest repeat.
            self.buffer = content;
            return Vec::new();
        }

        // Flush: the accumulated repeat first, then exactly the new part.
        let mut out = Vec::new();
        let finish = self.take_pending_finish();
        if self.buffer.is_empty() {
            out.push(self.synth_delta(Some(content.as_str()), finish.as_ref()));
        } else {
            let suffix = if repeats {
                &content[self.buffer.len()..]
            } else {
                // Upstream violated prefix growth; forwarding beats eliding.
                content.as_str()
            };
            let buffer = self.buffer.clone();
            out.push(self.synth_delta(Some(buffer.as_str()), None));
            if suffix.is_empty() {
                if finish.is_some() {
                    out.push(self.synth_delta(None, finish.as_ref()));
                }
            } else {
                out.push(self.synth_delta(Some(suffix), finish.as_ref()));
            }
        }
        self.buffer = content;
        self.transition(StreamPhase::NormalFlow);
        self.stats.frames_emitted += out.len() as u64;
        out
    }

    fn on_normal_flow(&mut self, payload: &str, content: String) -> Vec<String> {
        let finish = self.take_pending_finish();
        // Late stutter guard: a chunk that repeats the whole previous chunk
        // and extends it is still a repeat artifact, whatever the detector
        // said. Emit only the new suffix so content is never duplicated.
        let out = if content.len() > self.buffer.len()
            && !self.buffer.is_empty()
            && content.starts_with(&self.buffer)
        {
            debug!("late stutter repeat collapsed in normal flow");
            let suffix = content[self.buffer.len()..].to_string();
            self.synth_delta(Some(suffix.as_str()), finish.as_ref())
        } else {
            // finish_seen was recorded by take_pending_finish; the reason
            // itself already rides in the forwarded payload.
            payload.to_string()
        };
        self.buffer = content;
        self.stats.frames_emitted += 1;
        vec![out]
    }

    fn terminate(&mut self) -> Vec<String> {
        let mut out = Vec::new();
        let stuttering = self.phase == StreamPhase::Stuttering
            || (self.phase == StreamPhase::Recovering
                && self.resume_phase == StreamPhase::Stuttering);
        if stuttering && !self.buffer.is_empty() {
            // Drain content the client has never seen.
            let finish = self.take_pending_finish();
            let buffer = self.buffer.clone();
            out.push(self.synth_delta(Some(buffer.as_str()), finish.as_ref()));
        }
        if !self.finish_seen {
            out.push(self.synth_delta(None, Some(&json!("stop"))));
            self.finish_seen = true;
        }
        out.push("[DONE]".to_string());
        self.stats.frames_emitted += out.len() as u64;
        self.transition(StreamPhase::Terminating);
        self.log_stream_end();
        out
    }

    fn handle_error(&mut self, reason: String) -> Vec<String> {
        self.stats.errors_seen += 1;
        warn!(
            "dropping malformed stream frame ({} of {}): {}",
            self.stats.errors_seen, self.max_errors, reason
        );
        if self.stats.errors_seen <= self.max_errors {
            if self.phase != StreamPhase::Recovering {
                self.resume_phase = self.phase;
                self.transition(StreamPhase::Recovering);
            }
            return Vec::new();
        }

        // Error budget exhausted: tell the client and end the stream.
        let mut out = vec![self.error_delta("upstream stream exceeded the error budget")];
        out.push("[DONE]".to_string());
        self.stats.frames_emitted += out.len() as u64;
        self.finish_seen = true;
        self.transition(StreamPhase::Terminating);
        self.log_stream_end();
        out
    }

    fn take_pending_finish(&mut self) -> Option<Value> {
        let finish = self.pending_finish.take();
        if finish.is_some() {
            self.finish_seen = true;
        }
        finish
    }

    fn update_envelope(&mut self, chunk: &Value) {
        if !chunk["id"].is_null() {
            self.envelope.id = chunk["id"].clone();
        }
        if !chunk["created"].is_null() {
            self.envelope.created = chunk["created"].clone();
        }
        if !chunk["model"].is_null() {
            self.envelope.model = chunk["model"].clone();
        }
        if let Some(index) = chunk["choices"][0].get("index") {
            self.envelope.index = index.clone();
        }
    }

    /// Build a chat-completion chunk reusing the latest upstream envelope.
    fn synth_delta(&self, content: Option<&str>, finish: Option<&Value>) -> String {
        let mut delta = json!({});
        if let Some(content) = content {
            delta["content"] = json!(content);
        }
        let chunk = json!({
            "id": self.envelope.id,
            "object": "chat.completion.chunk",
            "created": self.envelope.created,
            "model": self.envelope.model,
            "choices": [{
                "index": self.envelope.index,
                "delta": delta,
                "finish_reason": finish.cloned().unwrap_or(Value::Null),
            }],
        });
        chunk.to_string()
    }

    fn error_delta(&self, message: &str) -> String {
        let chunk = json!({
            "id": self.envelope.id,
            "object": "chat.completion.chunk",
            "created": self.envelope.created,
            "model": self.envelope.model,
            "choices": [{
                "index": self.envelope.index,
                "delta": {},
                "finish_reason": "error",
            }],
            "error": { "message": message },
        });
        chunk.to_string()
    }

    fn transition(&mut self, to: StreamPhase) {
        if self.phase != to {
            debug!("stream state {} -> {}", self.phase, to);
            self.phase = to;
        }
    }

    fn log_stream_end(&self) {
        debug!(
            "stream finished: {} chunks, {} frames emitted, {} errors, {:?} elapsed",
            self.stats.chunks_seen,
            self.stats.frames_emitted,
            self.stats.errors_seen,
            self.stats.started_at.elapsed()
        );
    }
}
