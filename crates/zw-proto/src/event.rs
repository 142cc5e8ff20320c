use serde::{Deserialize, Serialize};

use crate::zone::{Coordinate, Zone, ZoneId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    Entered,
    Exited,
}

/// One fired zone notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZoneEvent {
    pub ts_unix_ms: i64,
    pub kind: EventKind,
    pub zone_id: ZoneId,
    pub zone_name: String,
    pub lat: f64,
    pub lon: f64,
    pub title: String,
    pub body: String,
}

impl ZoneEvent {
    pub fn new(ts_unix_ms: i64, kind: EventKind, zone: &Zone, at: Coordinate) -> Self {
        let (title, body) = match kind {
            EventKind::Entered => ("Entered zone".to_string(), format!("You entered {}", zone.name)),
            EventKind::Exited => ("Left zone".to_string(), format!("You left {}", zone.name)),
        };
        Self {
            ts_unix_ms,
            kind,
            zone_id: zone.id.clone(),
            zone_name: zone.name.clone(),
            lat: at.latitude,
            lon: at.longitude,
            title,
            body,
        }
    }
}
