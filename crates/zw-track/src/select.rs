use serde::Deserialize;
use tracing::warn;
use zw_proto::{Zone, ZoneId};

/// Chooses which stored zone a session tracks.
pub trait SelectZone {
    fn select_active_zone(&self, zones: &[Zone]) -> Option<Zone>;
}

impl<F> SelectZone for F
where
    F: Fn(&[Zone]) -> Option<Zone>,
{
    fn select_active_zone(&self, zones: &[Zone]) -> Option<Zone> {
        self(zones)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ZoneSelector {
    /// The single stored zone; nothing when zero or several are stored.
    Only,
    /// The most recently appended zone.
    Latest,
    ById(ZoneId),
}

impl Default for ZoneSelector {
    fn default() -> Self {
        Self::Latest
    }
}

impl SelectZone for ZoneSelector {
    fn select_active_zone(&self, zones: &[Zone]) -> Option<Zone> {
        match self {
            ZoneSelector::Only => match zones {
                [z] => Some(z.clone()),
                [] => None,
                _ => {
                    warn!(count = zones.len(), "select: 'only' policy with several stored zones; none selected");
                    None
                }
            },
            ZoneSelector::Latest => zones.last().cloned(),
            ZoneSelector::ById(id) => zones.iter().rev().find(|z| &z.id == id).cloned(),
        }
    }
}
