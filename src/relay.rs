use std::thread;

use crossbeam_channel::{Receiver, Sender};
use tracing::debug;

use crate::error::ConnError;
use crate::output::{ProgressEvent, ProgressSink};

pub const DONE_SENTINEL: &str = "[DONE]";

pub struct ChannelSink {
    sender: Sender<String>,
}

impl ChannelSink {
    pub fn new(sender: Sender<String>) -> Self {
        Self { sender }
    }
}

impl ProgressSink for ChannelSink {
    fn event(&self, event: ProgressEvent) {
        // A dropped receiver only means nobody is listening anymore.
        let _ = self.sender.send(event.to_line());
    }
}

/// Starts `job` on its own thread. A failed job contributes one
/// `Error: <message>` line; the stream always ends with [`DONE_SENTINEL`].
pub fn spawn_relay<T, F>(job: F) -> Receiver<String>
where
    T: Send + 'static,
    F: FnOnce(&dyn ProgressSink) -> Result<T, ConnError> + Send + 'static,
{
    let (sender, receiver) = crossbeam_channel::unbounded();
    thread::spawn(move || {
        let sink = ChannelSink::new(sender.clone());
        if let Err(err) = job(&sink) {
            debug!("relayed job failed: {err}");
            sink.event(ProgressEvent::error(err.to_string()));
        }
        let _ = sender.send(DONE_SENTINEL.to_string());
    });
    receiver
}
