//! Working Memory for Agent Loop
//!
//! Holds the observations a run has produced so far. The planner sees the
//! newest few on every iteration; the oldest entries are dropped once the
//! window is full so prompts stay bounded on long runs.

use std::collections::VecDeque;

/// Default number of observations kept per run
const DEFAULT_WINDOW: usize = 30;

/// Bounded observation history for one task run
#[derive(Debug, Clone)]
pub struct WorkingMemory {
    /// Observations in arrival order, oldest first
    observations: VecDeque<String>,

    /// Maximum number of observations retained
    window: usize,
}

impl WorkingMemory {
    /// Create a new working memory with the default window
    pub fn new() -> Self {
        Self::with_window(DEFAULT_WINDOW)
    }

    /// Create a new working memory keeping at most `window` observations
    pub fn with_window(window: usize) -> Self {
        let window = window.max(1);
        Self {
            observations: VecDeque::with_capacity(window),
            window,
        }
    }

    /// Record an observation. Blank text is ignored.
    pub fn push(&mut self, observation: impl AsRef<str>) {
        let trimmed = observation.as_ref().trim();
        if trimmed.is_empty() {
            return;
        }

        self.observations.push_back(trimmed.to_string());
        while self.observations.len() > self.window {
            self.observations.pop_front();
        }
    }

    /// Up to `n` observations, newest first
    pub fn latest(&self, n: usize) -> Vec<&str> {
        self.observations
            .iter()
            .rev()
            .take(n)
            .map(String::as_str)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.observations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observations.is_empty()
    }

    pub fn window(&self) -> usize {
        self.window
    }

    /// Clear all observations
    pub fn clear(&mut self) {
        self.observations.clear();
    }
}

impl Default for WorkingMemory {
    fn default() -> Self {
        Self::new()
    }
}
