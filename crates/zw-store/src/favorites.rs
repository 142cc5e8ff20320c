use zw_proto::{Zone, ZoneId};

use crate::error::StoreError;
use crate::favorites_key;
use crate::kv::{get_json, set_json, KvStore};

/// Per-owner favorite zones. No two entries share an id.
#[derive(Debug, Clone)]
pub struct Favorites<K> {
    kv: K,
}

impl<K: KvStore> Favorites<K> {
    pub fn new(kv: K) -> Self {
        Self { kv }
    }

    pub fn list(&self, owner: &str) -> Result<Vec<Zone>, StoreError> {
        Ok(get_json(&self.kv, &favorites_key(owner))?.unwrap_or_default())
    }

    /// Returns the list after the call; adding an existing id is a no-op.
    pub fn add(&self, owner: &str, zone: &Zone) -> Result<Vec<Zone>, StoreError> {
        let mut favs = self.list(owner)?;
        if favs.iter().any(|z| z.id == zone.id) {
            return Ok(favs);
        }
        favs.push(zone.clone());
        set_json(&self.kv, &favorites_key(owner), &favs)?;
        Ok(favs)
    }

    pub fn remove(&self, owner: &str, id: &ZoneId) -> Result<Vec<Zone>, StoreError> {
        let mut favs = self.list(owner)?;
        let before = favs.len();
        favs.retain(|z| &z.id != id);
        if favs.len() != before {
            set_json(&self.kv, &favorites_key(owner), &favs)?;
        }
        Ok(favs)
    }

    pub fn is_favorite(&self, owner: &str, id: &ZoneId) -> Result<bool, StoreError> {
        Ok(self.list(owner)?.iter().any(|z| &z.id == id))
    }
}
