mod attributes;
mod channel;
mod config;
mod context;
mod device;
mod error;
mod model;
#[cfg(feature = "mqtt")]
mod mqtt_transport;
mod node;
mod property;
mod reconciler;
mod transport;
mod value;

pub use attributes::{
    AttributeChange, AttributeError, AttributeField, AttributeFields, AttributeSet,
    AttributeValues,
};
pub use channel::*;
pub use config::*;
pub use context::EntityState;
pub use device::*;
pub use error::*;
pub use model::*;
#[cfg(feature = "mqtt")]
pub use mqtt_transport::*;
pub use node::*;
pub use property::*;
pub use reconciler::*;
pub use transport::*;
pub use value::*;

pub use homie5::HomieID;
