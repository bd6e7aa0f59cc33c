//! Channel hand-off between the sequencer and the dataplane task.
//!
//! [`ChannelSink`] is a [`Sink`] that never blocks the flushing thread; the
//! [`Decoupler`] end drains it on the consumer task in emission order.

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::messages::Message;
use crate::sink::Sink;

/// Creates a connected sink/receiver pair.
pub fn channel() -> (ChannelSink, Decoupler) {
    let (tx, rx) = mpsc::unbounded_channel();
    (ChannelSink { tx }, Decoupler { rx })
}

/// Sending half. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<Message>,
}

impl ChannelSink {
    /// Returns true once the receiving side has gone away.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl Sink for ChannelSink {
    fn send(&mut self, msg: Message) {
        if let Err(mpsc::error::SendError(msg)) = self.tx.send(msg) {
            warn!(kind = msg.kind(), "Dataplane receiver gone, dropping message");
        }
    }
}

/// Receiving half.
#[derive(Debug)]
pub struct Decoupler {
    rx: mpsc::UnboundedReceiver<Message>,
}

impl Decoupler {
    /// Waits for the next message. `None` once every sender is dropped.
    pub async fn recv(&mut self) -> Option<Message> {
        self.rx.recv().await
    }

    /// Returns a message only if one is already queued.
    pub fn try_recv(&mut self) -> Option<Message> {
        self.rx.try_recv().ok()
    }

    /// Forwards messages into `sink` until cancelled or every sender is
    /// dropped. Returns the number of messages forwarded.
    pub async fn send_to<S: Sink>(mut self, sink: &mut S, cancel: CancellationToken) -> usize {
        let mut forwarded = 0usize;
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!(forwarded, "Decoupler cancelled");
                    break;
                }
                msg = self.rx.recv() => match msg {
                    Some(msg) => {
                        debug!(kind = msg.kind(), "Forwarding message");
                        sink.send(msg);
                        forwarded += 1;
                    }
                    None => {
                        info!(forwarded, "All senders closed, decoupler exiting");
                        break;
                    }
                },
            }
        }
        forwarded
    }
}
