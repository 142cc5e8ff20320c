pub mod event;
pub mod zone;

pub use event::{EventKind, ZoneEvent};
pub use zone::{Coordinate, Zone, ZoneId};
