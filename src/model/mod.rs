mod entity_attributes;
mod events;
mod snapshot;

pub use entity_attributes::*;
pub use events::*;
pub use snapshot::*;
