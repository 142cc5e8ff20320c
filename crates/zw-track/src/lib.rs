pub mod doctor;
pub mod geo;
pub mod gnss;
pub mod location;
pub mod notify;
pub mod select;
pub mod session;

pub use location::{LocationError, LocationSource, Subscription, WatchOptions};
pub use notify::NotificationSink;
pub use select::{SelectZone, ZoneSelector};
pub use session::{Containment, ContainmentState, ContainmentTracker, Session, SessionCommand, SessionHandle, ZoneStatus};
