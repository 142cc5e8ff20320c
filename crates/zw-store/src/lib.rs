pub mod auth;
pub mod doctor;
pub mod error;
pub mod favorites;
pub mod kv;
pub mod zones;

pub use auth::{Auth, AuthError, Credentials};
pub use error::StoreError;
pub use favorites::Favorites;
pub use kv::{FileKv, KvStore, MemoryKv};
pub use zones::{filter_by_name, find_zone, zone_detail, KvZoneStore, ZoneDetail, ZoneStore};

pub const USER_KEY: &str = "user";

pub fn zones_key(owner: &str) -> String {
    format!("geofences_{}", owner)
}

pub fn favorites_key(owner: &str) -> String {
    format!("favorites_{}", owner)
}
