use tracing::debug;
use zw_proto::{Zone, ZoneId};

use crate::error::StoreError;
use crate::favorites::Favorites;
use crate::kv::{get_json, set_json, KvStore};
use crate::zones_key;

/// Durable zone definitions, keyed by owner. Append-only.
pub trait ZoneStore: Send {
    fn load_zones(&self, owner: &str) -> Result<Vec<Zone>, StoreError>;
    fn append_zone(&self, owner: &str, zone: &Zone) -> Result<(), StoreError>;
}

#[derive(Debug, Clone)]
pub struct KvZoneStore<K> {
    kv: K,
}

impl<K: KvStore> KvZoneStore<K> {
    pub fn new(kv: K) -> Self {
        Self { kv }
    }
}

impl<K: KvStore> ZoneStore for KvZoneStore<K> {
    fn load_zones(&self, owner: &str) -> Result<Vec<Zone>, StoreError> {
        Ok(get_json(&self.kv, &zones_key(owner))?.unwrap_or_default())
    }

    fn append_zone(&self, owner: &str, zone: &Zone) -> Result<(), StoreError> {
        let key = zones_key(owner);
        let mut zones: Vec<Zone> = get_json(&self.kv, &key)?.unwrap_or_default();
        zones.push(zone.clone());
        set_json(&self.kv, &key, &zones)?;
        debug!(owner, zone = %zone.id, total = zones.len(), "zone appended");
        Ok(())
    }
}

/// Zones whose name contains `query`, ignoring case. A blank query keeps
/// every zone.
pub fn filter_by_name(zones: Vec<Zone>, query: &str) -> Vec<Zone> {
    if query.trim().is_empty() {
        return zones;
    }
    let q = query.to_lowercase();
    zones.into_iter().filter(|z| z.name.to_lowercase().contains(&q)).collect()
}

/// The first stored zone with `id`.
pub fn find_zone<Z: ZoneStore + ?Sized>(store: &Z, owner: &str, id: &ZoneId) -> Result<Option<Zone>, StoreError> {
    Ok(store.load_zones(owner)?.into_iter().find(|z| &z.id == id))
}

#[derive(Debug, Clone, PartialEq)]
pub struct ZoneDetail {
    pub zone: Zone,
    pub favorite: bool,
}

/// One stored zone together with its favorite flag.
pub fn zone_detail<Z: ZoneStore + ?Sized, K: KvStore>(
    store: &Z,
    favorites: &Favorites<K>,
    owner: &str,
    id: &ZoneId,
) -> Result<Option<ZoneDetail>, StoreError> {
    let Some(zone) = find_zone(store, owner, id)? else {
        return Ok(None);
    };
    let favorite = favorites.is_favorite(owner, id)?;
    Ok(Some(ZoneDetail { zone, favorite }))
}
