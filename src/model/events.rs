use std::{
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use homie5::HomieID;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::{ChannelDescriptor, DeviceAttributes, NodeAttributes, PropertyValue};

/// Identifies one property of one device.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PropertyPath {
    pub device_id: HomieID,
    pub node_id: HomieID,
    pub property_id: HomieID,
}

impl PropertyPath {
    pub fn new(device_id: HomieID, node_id: HomieID, property_id: HomieID) -> Self {
        Self {
            device_id,
            node_id,
            property_id,
        }
    }

    /// `node_id/property_id`
    pub fn channel_uid(&self) -> String {
        format!("{}/{}", self.node_id, self.property_id)
    }
}

impl fmt::Display for PropertyPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.device_id, self.node_id, self.property_id)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TreeEvent {
    /// Sent once the device attributes are discovered and again on every later change.
    DeviceChanged {
        device_id: HomieID,
        attributes: DeviceAttributes,
    },
    /// The device was stopped, after all of its nodes were removed.
    DeviceRemoved {
        device_id: HomieID,
    },
    NodeAdded {
        device_id: HomieID,
        node_id: HomieID,
        attributes: NodeAttributes,
    },
    NodeChanged {
        device_id: HomieID,
        node_id: HomieID,
        attributes: NodeAttributes,
    },
    NodeRemoved {
        device_id: HomieID,
        node_id: HomieID,
    },
    /// A property's attributes are complete and its channel was derived for the first time.
    PropertyReady {
        path: PropertyPath,
        channel: ChannelDescriptor,
    },
    /// The channel of a property was re-derived after an attribute change.
    PropertyChanged {
        path: PropertyPath,
        channel: ChannelDescriptor,
    },
    PropertyRemoved {
        path: PropertyPath,
    },
    PropertyValue {
        path: PropertyPath,
        value: PropertyValue,
    },
    PropertyTriggered {
        path: PropertyPath,
        event: String,
    },
}

pub type TreeEventSender = mpsc::UnboundedSender<TreeEvent>;

/// Fan-out of [`TreeEvent`]s to every registered listener.
#[derive(Debug, Clone, Default)]
pub struct EventHub {
    listeners: Arc<Mutex<Vec<TreeEventSender>>>,
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    fn listeners(&self) -> MutexGuard<'_, Vec<TreeEventSender>> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a listener. Registering the same channel twice has no effect, returns
    /// false in that case.
    pub fn add_listener(&self, listener: TreeEventSender) -> bool {
        let mut listeners = self.listeners();
        if listeners.iter().any(|l| l.same_channel(&listener)) {
            log::warn!("Event listener is already registered, ignoring");
            return false;
        }
        listeners.push(listener);
        true
    }

    pub fn remove_listener(&self, listener: &TreeEventSender) {
        self.listeners().retain(|l| !l.same_channel(listener));
    }

    pub fn listener_count(&self) -> usize {
        self.listeners().len()
    }

    pub fn emit(&self, event: TreeEvent) {
        log::trace!("Emitting {:?}", event);
        self.listeners()
            .retain(|listener| listener.send(event.clone()).is_ok());
    }
}
