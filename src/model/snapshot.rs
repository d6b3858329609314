use homie5::HomieID;
use serde::{Deserialize, Serialize};

use crate::{DeviceAttributes, NodeAttributes, PropertyAttributes};

/// Persisted form of a device tree. Restoring it rebuilds the tree without waiting for
/// the broker.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceSnapshot {
    pub attributes: DeviceAttributes,
    pub nodes: Vec<NodeSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSnapshot {
    pub id: HomieID,
    #[serde(default)]
    pub attributes: NodeAttributes,
    #[serde(default)]
    pub properties: Vec<PropertySnapshot>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertySnapshot {
    pub id: HomieID,
    #[serde(default)]
    pub attributes: PropertyAttributes,
}

impl DeviceSnapshot {
    pub fn node(&self, node_id: &HomieID) -> Option<&NodeSnapshot> {
        self.nodes.iter().find(|node| &node.id == node_id)
    }
}

impl NodeSnapshot {
    pub fn property(&self, property_id: &HomieID) -> Option<&PropertySnapshot> {
        self.properties
            .iter()
            .find(|property| &property.id == property_id)
    }
}
