use std::future::Future;

use thiserror::Error;
use tokio::sync::mpsc;

/// A single message received on a subscribed topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicMessage {
    pub topic: String,
    pub payload: String,
}

impl TopicMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }
}

pub type MessageSender = mpsc::UnboundedSender<TopicMessage>;
pub type MessageReceiver = mpsc::UnboundedReceiver<TopicMessage>;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Error subscribing to [{topic}]: {reason}")]
    Subscribe { topic: String, reason: String },
    #[error("Error unsubscribing from [{topic}]: {reason}")]
    Unsubscribe { topic: String, reason: String },
    #[error("Error publishing to [{topic}]: {reason}")]
    Publish { topic: String, reason: String },
}

/// Broker connection the tree is synchronized over.
///
/// Topics are always exact, the tree never subscribes with wildcards. Every message
/// published on a subscribed topic (including retained messages delivered on
/// subscription) has to be forwarded to the handler passed to [`subscribe`].
///
/// [`subscribe`]: HomieTransport::subscribe
pub trait HomieTransport: Clone + Send + Sync + 'static {
    fn subscribe(
        &self,
        topic: &str,
        handler: MessageSender,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Drops every handler registered for `topic`. Unsubscribing an unknown topic is not an error.
    fn unsubscribe(&self, topic: &str) -> impl Future<Output = Result<(), TransportError>> + Send;

    fn publish(
        &self,
        topic: &str,
        payload: &str,
        retained: bool,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;
}
