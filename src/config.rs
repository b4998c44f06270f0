//! Engine configuration.

use serde::Deserialize;

/// Tunables for the engine. Deserializable from a host application's config
/// with every field optional.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Sample limit used by manual triggers that omit one or pass a value <= 0.
    pub default_sample_limit: u64,
    /// Error messages are truncated to this many bytes before being persisted.
    pub max_error_message_len: usize,
    pub default_page_limit: u32,
    pub max_page_limit: u32,
    pub min_comparison_experiments: usize,
    pub max_comparison_experiments: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_sample_limit: 1000,
            max_error_message_len: 2000,
            default_page_limit: 50,
            max_page_limit: 100,
            min_comparison_experiments: 2,
            max_comparison_experiments: 10,
        }
    }
}

impl EngineConfig {
    /// Resolve a caller-supplied sample limit.
    pub fn sample_limit(&self, requested: Option<i64>) -> u64 {
        match requested {
            Some(n) if n > 0 => n as u64,
            _ => self.default_sample_limit,
        }
    }

    /// Resolve a caller-supplied page size, clamped to `max_page_limit`.
    pub fn page_limit(&self, requested: Option<u32>) -> u32 {
        match requested {
            Some(0) | None => self.default_page_limit,
            Some(n) => n.min(self.max_page_limit),
        }
    }

    /// Truncate an error message on a char boundary.
    pub fn truncate_error(&self, message: &str) -> String {
        if message.len() <= self.max_error_message_len {
            return message.to_string();
        }
        let mut end = self.max_error_message_len;
        while !message.is_char_boundary(end) {
            end -= 1;
        }
        message[..end].to_string()
    }
}
