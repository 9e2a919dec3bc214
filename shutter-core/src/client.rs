use tokio::sync::mpsc;

use crate::{messages::OutboundMessage, util::Id};

pub type ClientId = Id<ClientHandle>;

/// A live connection that messages can be pushed to.
///
/// The handle is registered wherever the connection is known,
/// so domain code never touches the socket itself.
#[derive(Debug, Clone)]
pub struct ClientHandle {
    id: ClientId,
    outbound: mpsc::UnboundedSender<OutboundMessage>,
}

impl ClientHandle {
    pub fn new(outbound: mpsc::UnboundedSender<OutboundMessage>) -> Self {
        Self {
            id: Id::new(),
            outbound,
        }
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    /// Pushes a message to the connection. A closed channel means the
    /// socket already went away, which teardown takes care of.
    pub fn send(&self, message: OutboundMessage) {
        let _ = self.outbound.send(message);
    }
}
