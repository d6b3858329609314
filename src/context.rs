use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use homie5::HomieID;

use crate::{EventHub, TreeConfig, TreeEvent};

/// Lifecycle of a device, node or property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum EntityState {
    #[default]
    Unsubscribed,
    Discovering,
    Ready,
    /// Only reached by properties.
    ChannelStarted,
    Stopped,
}

impl EntityState {
    /// Discovery resolved at least once (or the entity was restored).
    pub fn is_ready(&self) -> bool {
        matches!(self, EntityState::Ready | EntityState::ChannelStarted)
    }
}

/// Read only context every entity of one device tree shares.
#[derive(Debug)]
pub(crate) struct TreeContext<T> {
    pub transport: T,
    pub config: Arc<TreeConfig>,
    pub events: EventHub,
    pub device_id: HomieID,
    channels_started: Arc<AtomicBool>,
}

impl<T: Clone> Clone for TreeContext<T> {
    fn clone(&self) -> Self {
        Self {
            transport: self.transport.clone(),
            config: self.config.clone(),
            events: self.events.clone(),
            device_id: self.device_id.clone(),
            channels_started: self.channels_started.clone(),
        }
    }
}

impl<T> TreeContext<T> {
    pub fn new(device_id: HomieID, transport: T, config: TreeConfig) -> Self {
        Self {
            transport,
            config: Arc::new(config),
            events: EventHub::new(),
            device_id,
            channels_started: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn device_topic(&self) -> String {
        format!(
            "{}/{}",
            self.config.base_topic.trim_end_matches('/'),
            self.device_id
        )
    }

    pub fn emit(&self, event: TreeEvent) {
        self.events.emit(event);
    }

    /// Whether properties created from now on should start their value channel right away.
    pub fn channels_started(&self) -> bool {
        self.channels_started.load(Ordering::Acquire)
    }

    pub fn set_channels_started(&self, started: bool) {
        self.channels_started.store(started, Ordering::Release);
    }
}
