//! Message sink: where the library reports what it is doing.
//!
//! The core never writes to the console or a log file itself.  Callers hand
//! an `Arc<dyn MessageSink>` to the encoder/decoder; [`TracingSink`] (the
//! default) forwards to `tracing`, [`ChannelSink`] turns messages into an
//! event stream, [`NullSink`] drops them.

use std::fmt;
use std::sync::Arc;
use crossbeam_channel::Sender;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageLevel {
    Info,
    Warning,
    Error,
    Debug,
}

impl MessageLevel {
    /// Single-letter prefix used when rendering a message as a line.
    pub fn prefix(self) -> &'static str {
        match self {
            MessageLevel::Info    => "I",
            MessageLevel::Warning => "W",
            MessageLevel::Error   => "E",
            MessageLevel::Debug   => "D",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub level: MessageLevel,
    pub text:  String,
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.level.prefix(), self.text)
    }
}

pub trait MessageSink: Send + Sync {
    fn emit(&self, level: MessageLevel, text: &str);

    fn info(&self, text: &str)    { self.emit(MessageLevel::Info, text) }
    fn warning(&self, text: &str) { self.emit(MessageLevel::Warning, text) }
    fn error(&self, text: &str)   { self.emit(MessageLevel::Error, text) }
    fn debug(&self, text: &str)   { self.emit(MessageLevel::Debug, text) }
}

/// Forwards every message to the matching `tracing` macro.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl MessageSink for TracingSink {
    fn emit(&self, level: MessageLevel, text: &str) {
        match level {
            MessageLevel::Info    => tracing::info!(target: "hexcell", "{text}"),
            MessageLevel::Warning => tracing::warn!(target: "hexcell", "{text}"),
            MessageLevel::Error   => tracing::error!(target: "hexcell", "{text}"),
            MessageLevel::Debug   => tracing::debug!(target: "hexcell", "{text}"),
        }
    }
}

/// Sends messages down a channel; a disconnected receiver is ignored.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: Sender<Message>,
}

impl ChannelSink {
    pub fn new(tx: Sender<Message>) -> Self {
        Self { tx }
    }
}

impl MessageSink for ChannelSink {
    fn emit(&self, level: MessageLevel, text: &str) {
        let _ = self.tx.send(Message { level, text: text.to_owned() });
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl MessageSink for NullSink {
    fn emit(&self, _: MessageLevel, _: &str) {}
}

pub fn default_sink() -> Arc<dyn MessageSink> {
    Arc::new(TracingSink)
}
