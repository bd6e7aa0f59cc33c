//! Message sink trait.

use crate::messages::Message;

/// Downstream consumer of sequenced messages.
///
/// Called synchronously from the thread that flushes the sequencer, once per
/// message, in emission order. Implementations must not block for long; use
/// [`ChannelSink`](crate::ChannelSink) to hand messages to another task.
pub trait Sink {
    fn send(&mut self, msg: Message);
}

/// Recording sink, mainly for tests and dry runs.
impl Sink for Vec<Message> {
    fn send(&mut self, msg: Message) {
        self.push(msg);
    }
}

impl<S: Sink + ?Sized> Sink for &mut S {
    fn send(&mut self, msg: Message) {
        (**self).send(msg);
    }
}

impl<S: Sink + ?Sized> Sink for Box<S> {
    fn send(&mut self, msg: Message) {
        (**self).send(msg);
    }
}

/// Adapts a closure into a [`Sink`].
pub struct FnSink<F>(pub F);

impl<F> Sink for FnSink<F>
where
    F: FnMut(Message),
{
    fn send(&mut self, msg: Message) {
        (self.0)(msg);
    }
}
