// Logical streams: ordered bidirectional channels multiplexed over one
// socket. A stream belongs to exactly one socket for its whole life.
use std::rc::Rc;

use petrel_wire::Message;

use crate::flow::{EventTrigger, Flow, Sink};
use crate::socket::SocketShared;

/// What a stream receiver observes.
#[derive(Debug)]
pub enum StreamEvent {
    /// A message from the remote end. Socket teardown synthesizes a final
    /// `Goodbye(SocketError)` so upper layers see one uniform termination
    /// signal.
    Message(Message),
    /// Liveness transition derived from heartbeats: `false` when the stream
    /// went unseen past the heartbeat timeout, `true` when it came back.
    Health(bool),
}

pub type StreamReceiver = Box<dyn FnMut(&mut Flow, StreamEvent) + 'static>;

/// Handle to one logical stream. Cloning shares the underlying stream; the
/// wire id stays fixed for the stream's lifetime.
#[derive(Clone)]
pub struct Stream {
    pub(crate) socket: Rc<SocketShared>,
    pub(crate) wire_id: u64,
}

impl Stream {
    /// Id this stream travels under on the wire.
    pub fn id(&self) -> u64 {
        self.wire_id
    }

    /// Queue a message. Returns false when the socket's send queue is past
    /// its limit; the message is still queued (sinks never drop), but the
    /// caller should pause until `write_trigger` is raised.
    pub fn send(&self, message: &Message) -> bool {
        self.socket.send_on_stream(self.wire_id, message)
    }

    /// Install the receiver for inbound events on this stream.
    pub fn set_receiver(&self, receiver: StreamReceiver) {
        self.socket.set_receiver(self.wire_id, receiver);
    }

    /// Tear the stream down. A graceful close tells the remote end first;
    /// either way the stream leaves the socket's routing table and the
    /// socket may close once its last stream is gone.
    pub fn close(&self, graceful: bool) {
        self.socket.close_stream(self.wire_id, graceful);
    }

    pub fn write_trigger(&self) -> EventTrigger {
        self.socket.write_trigger()
    }

    /// True until the stream is removed from its socket.
    pub fn is_open(&self) -> bool {
        self.socket.has_stream(self.wire_id)
    }
}

impl Sink<Message> for Stream {
    fn write(&self, item: Message) -> bool {
        self.send(&item)
    }

    fn write_trigger(&self) -> EventTrigger {
        Stream::write_trigger(self)
    }
}
