use std::{fmt, str::FromStr};

use homie5::HomieID;
use serde::{Deserialize, Serialize};

use crate::attributes::{
    parse_bool, parse_id_list, store, AttributeError, AttributeField, AttributeFields,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceState {
    #[default]
    Unknown,
    Init,
    Ready,
    Disconnected,
    Sleeping,
    Lost,
    Alert,
}

impl FromStr for DeviceState {
    type Err = AttributeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unknown" => Ok(DeviceState::Unknown),
            "init" => Ok(DeviceState::Init),
            "ready" => Ok(DeviceState::Ready),
            "disconnected" => Ok(DeviceState::Disconnected),
            "sleeping" => Ok(DeviceState::Sleeping),
            "lost" => Ok(DeviceState::Lost),
            "alert" => Ok(DeviceState::Alert),
            _ => Err(AttributeError::invalid("state", s, "unknown device state")),
        }
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self {
            DeviceState::Unknown => "unknown",
            DeviceState::Init => "init",
            DeviceState::Ready => "ready",
            DeviceState::Disconnected => "disconnected",
            DeviceState::Sleeping => "sleeping",
            DeviceState::Lost => "lost",
            DeviceState::Alert => "alert",
        };
        f.write_str(state)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Datatype {
    Integer,
    Float,
    Boolean,
    #[default]
    String,
    Enum,
    Color,
    Datetime,
}

impl Datatype {
    /// Unrecognized datatypes are treated as `string`.
    pub fn parse_lenient(payload: &str) -> Self {
        match payload {
            "integer" => Datatype::Integer,
            "float" => Datatype::Float,
            "boolean" => Datatype::Boolean,
            "string" => Datatype::String,
            "enum" => Datatype::Enum,
            "color" => Datatype::Color,
            "datetime" => Datatype::Datetime,
            other => {
                log::debug!("Unrecognized datatype [{}], treating it as string", other);
                Datatype::String
            }
        }
    }
}

impl fmt::Display for Datatype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let datatype = match self {
            Datatype::Integer => "integer",
            Datatype::Float => "float",
            Datatype::Boolean => "boolean",
            Datatype::String => "string",
            Datatype::Enum => "enum",
            Datatype::Color => "color",
            Datatype::Datetime => "datetime",
        };
        f.write_str(datatype)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceAttributes {
    pub homie: String,
    pub name: String,
    pub state: DeviceState,
    pub nodes: Vec<HomieID>,
}

impl AttributeFields for DeviceAttributes {
    const FIELDS: &'static [AttributeField] = &[
        AttributeField::mandatory("homie"),
        AttributeField::optional("name"),
        AttributeField::optional("state"),
        AttributeField::mandatory("nodes"),
    ];

    fn apply(&mut self, name: &str, payload: &str) -> Result<bool, AttributeError> {
        match name {
            "homie" => Ok(store(&mut self.homie, payload.to_owned())),
            "name" => Ok(store(&mut self.name, payload.to_owned())),
            "state" => Ok(store(&mut self.state, payload.parse()?)),
            "nodes" => Ok(store(&mut self.nodes, parse_id_list(name, payload))),
            _ => Err(AttributeError::Unknown(name.to_owned())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeAttributes {
    pub name: String,
    #[serde(rename = "type")]
    pub node_type: String,
    pub properties: Vec<HomieID>,
}

impl AttributeFields for NodeAttributes {
    const FIELDS: &'static [AttributeField] = &[
        AttributeField::optional("name"),
        AttributeField::optional("type"),
        AttributeField::mandatory("properties"),
    ];

    fn apply(&mut self, name: &str, payload: &str) -> Result<bool, AttributeError> {
        match name {
            "name" => Ok(store(&mut self.name, payload.to_owned())),
            "type" => Ok(store(&mut self.node_type, payload.to_owned())),
            "properties" => Ok(store(&mut self.properties, parse_id_list(name, payload))),
            _ => Err(AttributeError::Unknown(name.to_owned())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PropertyAttributes {
    pub name: String,
    pub settable: bool,
    pub retained: bool,
    pub unit: String,
    pub datatype: Datatype,
    pub format: String,
}

impl Default for PropertyAttributes {
    fn default() -> Self {
        Self {
            name: String::new(),
            settable: false,
            retained: true,
            unit: String::new(),
            datatype: Datatype::String,
            format: String::new(),
        }
    }
}

impl AttributeFields for PropertyAttributes {
    const FIELDS: &'static [AttributeField] = &[
        AttributeField::optional("name"),
        AttributeField::mandatory("settable"),
        AttributeField::mandatory("retained"),
        AttributeField::optional("unit"),
        AttributeField::mandatory("datatype"),
        AttributeField::optional("format"),
    ];

    fn apply(&mut self, name: &str, payload: &str) -> Result<bool, AttributeError> {
        match name {
            "name" => Ok(store(&mut self.name, payload.to_owned())),
            "settable" => Ok(store(&mut self.settable, parse_bool(name, payload)?)),
            "retained" => Ok(store(&mut self.retained, parse_bool(name, payload)?)),
            "unit" => Ok(store(&mut self.unit, payload.to_owned())),
            "datatype" => Ok(store(&mut self.datatype, Datatype::parse_lenient(payload))),
            "format" => Ok(store(&mut self.format, payload.to_owned())),
            _ => Err(AttributeError::Unknown(name.to_owned())),
        }
    }
}
