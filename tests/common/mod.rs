#![allow(dead_code)]

use std::{
    collections::HashMap,
    future::Future,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use hc_homie_tree::*;
use tokio::sync::mpsc;

#[derive(Debug, Default)]
struct BrokerState {
    retained: HashMap<String, String>,
    subscriptions: HashMap<String, Vec<MessageSender>>,
    published: Vec<(String, String, bool)>,
    failing: Vec<String>,
}

/// In-memory broker with retained messages and exact topic routing.
#[derive(Debug, Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Publishes a retained message as a remote device would.
    pub fn publish_retained(&self, topic: &str, payload: &str) {
        let mut state = self.state();
        state.retained.insert(topic.to_owned(), payload.to_owned());
        deliver(&mut state, topic, payload);
    }

    /// Publishes a non retained message as a remote device would.
    pub fn publish_event(&self, topic: &str, payload: &str) {
        deliver(&mut self.state(), topic, payload);
    }

    /// Makes every subscription on topics starting with `prefix` fail.
    pub fn fail_subscriptions(&self, prefix: &str) {
        self.state().failing.push(prefix.to_owned());
    }

    /// Undoes [`MemoryBroker::fail_subscriptions`] for `prefix`.
    pub fn allow_subscriptions(&self, prefix: &str) {
        self.state().failing.retain(|failing| failing != prefix);
    }

    pub fn subscriptions(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.state().subscriptions.keys().cloned().collect();
        topics.sort();
        topics
    }

    pub fn is_subscribed(&self, topic: &str) -> bool {
        self.state().subscriptions.contains_key(topic)
    }

    /// Messages published through the transport by the tree.
    pub fn published(&self) -> Vec<(String, String, bool)> {
        self.state().published.clone()
    }

    /// Publishes the attributes of a device with a single node.
    pub fn publish_device(&self, base: &str, nodes: &str) {
        self.publish_retained(&format!("{}/$homie", base), "4.0.0");
        self.publish_retained(&format!("{}/$name", base), "Test device");
        self.publish_retained(&format!("{}/$state", base), "ready");
        self.publish_retained(&format!("{}/$nodes", base), nodes);
    }

    pub fn publish_node(&self, base: &str, properties: &str) {
        self.publish_retained(&format!("{}/$name", base), "Test node");
        self.publish_retained(&format!("{}/$type", base), "sensor");
        self.publish_retained(&format!("{}/$properties", base), properties);
    }

    pub fn publish_property(
        &self,
        base: &str,
        datatype: &str,
        format: &str,
        settable: bool,
        retained: bool,
    ) {
        self.publish_retained(&format!("{}/$name", base), "Test property");
        self.publish_retained(&format!("{}/$settable", base), &settable.to_string());
        self.publish_retained(&format!("{}/$retained", base), &retained.to_string());
        self.publish_retained(&format!("{}/$datatype", base), datatype);
        self.publish_retained(&format!("{}/$format", base), format);
    }
}

fn deliver(state: &mut BrokerState, topic: &str, payload: &str) {
    if let Some(handlers) = state.subscriptions.get_mut(topic) {
        handlers.retain(|handler| handler.send(TopicMessage::new(topic, payload)).is_ok());
    }
}

impl HomieTransport for MemoryBroker {
    fn subscribe(
        &self,
        topic: &str,
        handler: MessageSender,
    ) -> impl Future<Output = Result<(), TransportError>> + Send {
        let result = {
            let mut state = self.state();
            if state.failing.iter().any(|prefix| topic.starts_with(prefix)) {
                Err(TransportError::Subscribe {
                    topic: topic.to_owned(),
                    reason: "refused by test broker".to_owned(),
                })
            } else {
                if let Some(payload) = state.retained.get(topic) {
                    let _ = handler.send(TopicMessage::new(topic, payload.as_str()));
                }
                state
                    .subscriptions
                    .entry(topic.to_owned())
                    .or_default()
                    .push(handler);
                Ok(())
            }
        };
        async move { result }
    }

    fn unsubscribe(&self, topic: &str) -> impl Future<Output = Result<(), TransportError>> + Send {
        self.state().subscriptions.remove(topic);
        async { Ok(()) }
    }

    fn publish(
        &self,
        topic: &str,
        payload: &str,
        retained: bool,
    ) -> impl Future<Output = Result<(), TransportError>> + Send {
        let mut state = self.state();
        state
            .published
            .push((topic.to_owned(), payload.to_owned(), retained));
        if retained {
            state.retained.insert(topic.to_owned(), payload.to_owned());
        }
        deliver(&mut state, topic, payload);
        async { Ok(()) }
    }
}

pub fn id(id: &str) -> HomieID {
    id.parse::<HomieID>().expect("valid homie id")
}

pub fn ids(list: &[&str]) -> Vec<HomieID> {
    list.iter().map(|value| id(value)).collect()
}

pub fn test_config() -> TreeConfig {
    TreeConfig::default().discovery_timeout(Duration::from_millis(500))
}

/// Waits for the next event, `None` when nothing arrives within a few (paused) seconds.
pub async fn next_event(receiver: &mut mpsc::UnboundedReceiver<TreeEvent>) -> Option<TreeEvent> {
    tokio::time::timeout(Duration::from_secs(5), receiver.recv())
        .await
        .ok()
        .flatten()
}

/// Drains all events that arrive until the tree has been idle for a (paused) second.
pub async fn drain_events(receiver: &mut mpsc::UnboundedReceiver<TreeEvent>) -> Vec<TreeEvent> {
    let mut events = Vec::new();
    while let Ok(Some(event)) = tokio::time::timeout(Duration::from_secs(1), receiver.recv()).await
    {
        events.push(event);
    }
    events
}

/// Lets spawned tasks run until they are all idle.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(100)).await;
}
