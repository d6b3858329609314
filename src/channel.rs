use std::fmt;

use crate::{PropertyAttributes, PropertyPath, ValueRepresentation};

/// Well known shapes of momentary (non retained) properties.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TriggerKind {
    /// `PRESSED` / `RELEASED`
    RawButton,
    /// `SHORT_PRESSED` / `LONG_PRESSED` / `DOUBLE_PRESSED`
    Button,
    /// `DIR1_PRESSED` / `DIR1_RELEASED` / `DIR2_PRESSED` / `DIR2_RELEASED`
    RawRocker,
    Generic,
}

impl TriggerKind {
    pub fn classify(format: &str) -> Self {
        let has_all = |events: &[&str]| events.iter().all(|event| format.contains(event));
        if has_all(&["DIR1_PRESSED", "DIR1_RELEASED", "DIR2_PRESSED", "DIR2_RELEASED"]) {
            TriggerKind::RawRocker
        } else if has_all(&["SHORT_PRESSED", "LONG_PRESSED", "DOUBLE_PRESSED"]) {
            TriggerKind::Button
        } else if has_all(&["PRESSED", "RELEASED"]) {
            TriggerKind::RawButton
        } else {
            TriggerKind::Generic
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    State { read_only: bool },
    Trigger(TriggerKind),
}

/// UI facing item type of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ItemType {
    Switch,
    Color,
    String,
    Number,
    Dimmer,
    DateTime,
    Trigger,
}

impl fmt::Display for ItemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let item_type = match self {
            ItemType::Switch => "Switch",
            ItemType::Color => "Color",
            ItemType::String => "String",
            ItemType::Number => "Number",
            ItemType::Dimmer => "Dimmer",
            ItemType::DateTime => "DateTime",
            ItemType::Trigger => "Trigger",
        };
        f.write_str(item_type)
    }
}

/// Everything a consumer needs to expose one property as a channel.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelDescriptor {
    /// `node_id/property_id`, stable for the lifetime of the property.
    pub uid: String,
    pub label: String,
    pub representation: ValueRepresentation,
    pub kind: ChannelKind,
    pub item_type: ItemType,
    pub unit: String,
    pub state_topic: Option<String>,
    pub command_topic: Option<String>,
}

impl ChannelDescriptor {
    /// Derives the full channel of a property. Always computed from scratch.
    pub fn derive(path: &PropertyPath, topic: &str, attributes: &PropertyAttributes) -> Self {
        let representation = ValueRepresentation::derive(attributes);
        let kind = if attributes.retained {
            ChannelKind::State {
                read_only: !attributes.settable,
            }
        } else {
            ChannelKind::Trigger(TriggerKind::classify(&attributes.format))
        };
        let item_type = match kind {
            ChannelKind::Trigger(_) => ItemType::Trigger,
            ChannelKind::State { .. } => match representation {
                ValueRepresentation::Switch => ItemType::Switch,
                ValueRepresentation::Color(_) => ItemType::Color,
                ValueRepresentation::Number { .. } => ItemType::Number,
                ValueRepresentation::Percentage { .. } => ItemType::Dimmer,
                ValueRepresentation::DateTime => ItemType::DateTime,
                ValueRepresentation::Enumeration(_) | ValueRepresentation::Text => {
                    ItemType::String
                }
            },
        };
        let label = if attributes.name.is_empty() {
            path.property_id.to_string()
        } else {
            attributes.name.clone()
        };

        Self {
            uid: path.channel_uid(),
            label,
            representation,
            kind,
            item_type,
            unit: attributes.unit.clone(),
            state_topic: attributes.retained.then(|| topic.to_owned()),
            command_topic: attributes.settable.then(|| format!("{}/set", topic)),
        }
    }

    pub fn is_trigger(&self) -> bool {
        matches!(self.kind, ChannelKind::Trigger(_))
    }

    pub fn is_read_only(&self) -> bool {
        self.command_topic.is_none()
    }
}
