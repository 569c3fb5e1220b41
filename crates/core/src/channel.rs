//! Host-visible, line-oriented log channels.

use std::sync::{Arc, Mutex};

/// Sink for human-readable lines shown by the host.
///
/// Implementations must not fail; there is no backpressure signal.
pub trait OutputChannel: Send + Sync {
    fn append_line(&self, line: &str);
}

impl<T: OutputChannel + ?Sized> OutputChannel for Arc<T> {
    fn append_line(&self, line: &str) {
        (**self).append_line(line)
    }
}

/// Forwards lines to `tracing` at info level.
#[derive(Debug, Clone)]
pub struct TracingChannel {
    name: String,
}

impl TracingChannel {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl OutputChannel for TracingChannel {
    fn append_line(&self, line: &str) {
        tracing::info!(target: "sandbridge::channel", channel = %self.name, "{line}");
    }
}

/// Collects lines in memory. Clones share the same buffer.
#[derive(Debug, Clone, Default)]
pub struct MemoryChannel {
    lines: Arc<Mutex<Vec<String>>>,
}

impl MemoryChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of every line appended so far.
    pub fn lines(&self) -> Vec<String> {
        self.lines
            .lock()
            .map(|lines| lines.clone())
            .unwrap_or_default()
    }
}

impl OutputChannel for MemoryChannel {
    fn append_line(&self, line: &str) {
        if let Ok(mut lines) = self.lines.lock() {
            lines.push(line.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_channel_clones_share_lines() {
        let channel = MemoryChannel::new();
        let clone = channel.clone();
        channel.append_line("one");
        clone.append_line("two");
        assert_eq!(channel.lines(), vec!["one", "two"]);
    }

    #[test]
    fn arc_channel_delegates() {
        let inner = MemoryChannel::new();
        let shared: Arc<dyn OutputChannel> = Arc::new(inner.clone());
        shared.append_line("hello");
        assert_eq!(inner.lines(), vec!["hello"]);
    }

    #[test]
    fn tracing_channel_keeps_name() {
        let channel = TracingChannel::new("protolsp");
        assert_eq!(channel.name(), "protolsp");
        channel.append_line("no subscriber installed, must not panic");
    }
}
