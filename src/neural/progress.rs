// projeto: npredict
// file: src/neural/progress.rs
// Progress sinks and cancellation queries handed to long-running operations

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam::channel::Sender;
use log::info;

/// Receives incremental progress text.
pub trait ProgressSink: Send + Sync {
    fn message(&self, text: &str);
}

/// Polled by training loops; never preempts.
pub trait CancelQuery: Send + Sync {
    fn cancel_requested(&self) -> bool;
}

/// Forwards messages to the `log` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl ProgressSink for LogSink {
    fn message(&self, text: &str) {
        info!("{}", text);
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl ProgressSink for NullSink {
    fn message(&self, _text: &str) {}
}

/// Sends each message over a channel so another thread can display it.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: Sender<String>,
}

impl ChannelSink {
    pub fn new(tx: Sender<String>) -> Self {
        ChannelSink { tx }
    }
}

impl ProgressSink for ChannelSink {
    fn message(&self, text: &str) {
        // a dropped receiver just means nobody is listening any more
        let _ = self.tx.send(text.to_string());
    }
}

/// Shared cancellation flag.
#[derive(Debug, Default, Clone)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        CancelToken::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn reset(&self) {
        self.flag.store(false, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

impl CancelQuery for CancelToken {
    fn cancel_requested(&self) -> bool {
        self.is_cancelled()
    }
}

impl CancelQuery for AtomicBool {
    fn cancel_requested(&self) -> bool {
        self.load(Ordering::SeqCst)
    }
}

/// Caller-owned collaborators for `train`/`fit` calls.
#[derive(Clone, Copy)]
pub struct TrainingContext<'a> {
    sink: Option<&'a dyn ProgressSink>,
    cancel: Option<&'a dyn CancelQuery>,
}

impl<'a> Default for TrainingContext<'a> {
    fn default() -> Self {
        TrainingContext::silent()
    }
}

impl<'a> TrainingContext<'a> {
    pub fn silent() -> Self {
        TrainingContext { sink: None, cancel: None }
    }

    pub fn with_sink(mut self, sink: &'a dyn ProgressSink) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn with_cancel(mut self, cancel: &'a dyn CancelQuery) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn report(&self, text: &str) {
        if let Some(sink) = self.sink {
            sink.message(text);
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.map(|c| c.cancel_requested()).unwrap_or(false)
    }
}
