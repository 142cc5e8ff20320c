use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::mpsc;
use zw_proto::Coordinate;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum LocationError {
    #[error("location permission denied")]
    PermissionDenied,
    #[error("location permission revoked")]
    PermissionRevoked,
    #[error("position unavailable: {0}")]
    Unavailable(String),
    #[error("fix below quality gate (sats={sats}, hdop={hdop}, age={fix_age_s}s)")]
    PoorFix { sats: u8, hdop: f32, fix_age_s: u64 },
    #[error("location source busy: {0}")]
    Busy(&'static str),
    #[error("location io: {0}")]
    Io(String),
}

pub type PositionUpdate = Result<Coordinate, LocationError>;

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct WatchOptions {
    pub high_accuracy: bool,
    /// Minimum movement before a new sample is delivered.
    pub min_distance_m: f64,
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self { high_accuracy: true, min_distance_m: 1.0 }
    }
}

/// Handle on a live position stream. It is the only way to cancel the
/// stream: consume it with [`LocationSource::unsubscribe`] or drop it. Either
/// closes the channel, which stops the producer.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    updates: mpsc::Receiver<PositionUpdate>,
}

impl Subscription {
    /// Returns the producer side together with the handle.
    pub fn channel(id: u64, buffer: usize) -> (mpsc::Sender<PositionUpdate>, Self) {
        let (tx, updates) = mpsc::channel(buffer.max(1));
        (tx, Self { id, updates })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Next update in delivery order; `None` once the producer is gone.
    pub async fn next(&mut self) -> Option<PositionUpdate> {
        self.updates.recv().await
    }

    pub fn cancel(mut self) {
        self.updates.close();
    }
}

#[async_trait]
pub trait LocationSource: Send {
    /// One-shot, not retried by callers.
    async fn request_permission(&mut self) -> bool;

    async fn current_position(&mut self) -> Result<Coordinate, LocationError>;

    fn subscribe(&mut self, opts: WatchOptions) -> Result<Subscription, LocationError>;

    fn unsubscribe(&mut self, sub: Subscription) {
        sub.cancel();
    }
}
