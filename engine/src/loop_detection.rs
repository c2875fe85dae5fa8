//! Repetition detection over a streamed model turn.
//!
//! Two signals:
//! - the same tool call (name and arguments) issued
//!   [`TOOL_CALL_LOOP_THRESHOLD`] times in a row;
//! - the same [`CONTENT_CHUNK_SIZE`]-character window of streamed text seen
//!   [`CONTENT_LOOP_THRESHOLD`] times, close together.
//!
//! Text inside fenced code blocks is not analyzed; code repeats legitimately.

use std::collections::HashMap;

use strand_types::FunctionCall;

pub const TOOL_CALL_LOOP_THRESHOLD: u32 = 5;
pub const CONTENT_LOOP_THRESHOLD: usize = 10;
pub const CONTENT_CHUNK_SIZE: usize = 50;
const MAX_TRACKED_CONTENT: usize = 1000;

#[derive(Debug, Default)]
pub struct LoopDetector {
    last_tool_call: Option<String>,
    tool_call_repetitions: u32,
    content: Vec<char>,
    next_chunk_start: usize,
    chunk_positions: HashMap<String, Vec<usize>>,
    in_code_block: bool,
    detected: bool,
}

impl LoopDetector {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget everything. Called when a new prompt starts.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    #[must_use]
    pub fn detected(&self) -> bool {
        self.detected
    }

    /// Record a completed tool call. Returns `true` once a loop is detected.
    pub fn add_tool_call(&mut self, call: &FunctionCall) -> bool {
        if self.detected {
            return true;
        }
        let key = format!("{}:{}", call.name, call.args);
        if self.last_tool_call.as_deref() == Some(key.as_str()) {
            self.tool_call_repetitions += 1;
        } else {
            self.last_tool_call = Some(key);
            self.tool_call_repetitions = 1;
        }
        if self.tool_call_repetitions >= TOOL_CALL_LOOP_THRESHOLD {
            tracing::warn!(
                tool = %call.name,
                repetitions = self.tool_call_repetitions,
                "Repeated identical tool calls"
            );
            self.detected = true;
        }
        self.detected
    }

    /// Record streamed text. Returns `true` once a loop is detected.
    pub fn add_content(&mut self, text: &str) -> bool {
        if self.detected {
            return true;
        }

        let fences = text.matches("```").count();
        if fences > 0 {
            self.reset_content();
            if fences % 2 == 1 {
                self.in_code_block = !self.in_code_block;
            }
            return false;
        }
        if self.in_code_block {
            return false;
        }

        self.content.extend(text.chars());
        self.truncate_content();

        while self.next_chunk_start + CONTENT_CHUNK_SIZE <= self.content.len() {
            let start = self.next_chunk_start;
            let chunk: String = self.content[start..start + CONTENT_CHUNK_SIZE].iter().collect();
            self.next_chunk_start += 1;
            if self.record_chunk(chunk, start) {
                tracing::warn!("Repeated streamed content");
                self.detected = true;
                return true;
            }
        }
        false
    }

    fn record_chunk(&mut self, chunk: String, position: usize) -> bool {
        let positions = self.chunk_positions.entry(chunk).or_default();
        positions.push(position);
        if positions.len() < CONTENT_LOOP_THRESHOLD {
            return false;
        }

        let recent = &positions[positions.len() - CONTENT_LOOP_THRESHOLD..];
        let span = recent[CONTENT_LOOP_THRESHOLD - 1] - recent[0];
        let average_distance = span / (CONTENT_LOOP_THRESHOLD - 1);
        average_distance <= CONTENT_CHUNK_SIZE * 3 / 2
    }

    fn truncate_content(&mut self) {
        if self.content.len() <= MAX_TRACKED_CONTENT {
            return;
        }
        let dropped = self.content.len() - MAX_TRACKED_CONTENT;
        self.content.drain(..dropped);
        self.next_chunk_start = self.next_chunk_start.saturating_sub(dropped);
        self.chunk_positions.retain(|_, positions| {
            positions.retain(|p| *p >= dropped);
            for p in positions.iter_mut() {
                *p -= dropped;
            }
            !positions.is_empty()
        });
    }

    fn reset_content(&mut self) {
        self.content.clear();
        self.next_chunk_start = 0;
        self.chunk_positions.clear();
    }
}
