//! Configuration for the memory backend.

/// Configuration for [`crate::MemoryBackend`].
#[derive(Debug, Clone)]
pub struct BackendConfig {
    /// Capacity of each hint subscriber's channel. Hints beyond a full
    /// channel are dropped; they are advisory.
    pub hint_buffer: usize,
}

impl BackendConfig {
    /// Creates the default configuration.
    pub fn new() -> Self {
        Self { hint_buffer: 64 }
    }

    /// Sets the hint channel capacity.
    pub fn with_hint_buffer(mut self, hint_buffer: usize) -> Self {
        self.hint_buffer = hint_buffer;
        self
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self::new()
    }
}
