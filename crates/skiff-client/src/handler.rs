//! Callbacks for received messages.

use async_trait::async_trait;
use skiff_protocol::Message;

/// Receives every `DATA` message of a subscribing link, in order.
///
/// Handlers run on the link's task: a slow handler slows the link down,
/// which is how back-pressure reaches the broker. Any `Fn(Message)` closure
/// is a handler.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    /// Handle one message.
    async fn handle(&self, message: Message);
}

#[async_trait]
impl<F> MessageHandler for F
where
    F: Fn(Message) + Send + Sync + 'static,
{
    async fn handle(&self, message: Message) {
        self(message);
    }
}
