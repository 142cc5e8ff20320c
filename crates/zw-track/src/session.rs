use anyhow::{Context, Result};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use zw_proto::{Coordinate, EventKind, Zone, ZoneEvent};
use zw_store::ZoneStore;

use crate::geo::is_within;
use crate::location::{LocationError, LocationSource, PositionUpdate, Subscription, WatchOptions};
use crate::notify::NotificationSink;
use crate::select::SelectZone;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Containment {
    Unknown,
    Inside,
    Outside,
}

/// Whether the active zone is known to be persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZoneStatus {
    Pending,
    Confirmed,
}

#[derive(Debug, Clone)]
pub struct ActiveZone {
    pub zone: Zone,
    pub status: ZoneStatus,
}

#[derive(Debug, Clone, Default)]
pub struct ContainmentState {
    pub current_position: Option<Coordinate>,
    pub active_zone: Option<ActiveZone>,
    pub is_inside: bool,
    pub entered_latch: bool,
    pub exited_latch: bool,
    pub has_location_permission: bool,
}

/// Edge-triggered entry/exit detection against one zone.
///
/// The two latches are never set at the same time: setting one always
/// clears the other.
#[derive(Debug, Clone)]
pub struct ContainmentTracker {
    state: ContainmentState,
    phase: Containment,
}

impl Default for ContainmentTracker {
    fn default() -> Self {
        Self { state: ContainmentState::default(), phase: Containment::Unknown }
    }
}

impl ContainmentTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> &ContainmentState {
        &self.state
    }

    pub fn phase(&self) -> Containment {
        self.phase
    }

    pub fn set_permission(&mut self, granted: bool) {
        self.state.has_location_permission = granted;
    }

    /// Records a sample. Returns the transition to notify, if any.
    pub fn observe(&mut self, position: Coordinate) -> Option<EventKind> {
        self.state.current_position = Some(position);
        let zone = &self.state.active_zone.as_ref()?.zone;

        let inside = is_within(zone, &position);
        self.state.is_inside = inside;

        if inside {
            self.phase = Containment::Inside;
            self.state.exited_latch = false;
            if !self.state.entered_latch {
                self.state.entered_latch = true;
                return Some(EventKind::Entered);
            }
        } else {
            self.phase = Containment::Outside;
            self.state.entered_latch = false;
            if !self.state.exited_latch {
                self.state.exited_latch = true;
                return Some(EventKind::Exited);
            }
        }
        None
    }

    /// Replaces the active zone and re-arms the entry notification. The exit
    /// latch is left as it was.
    pub fn set_zone(&mut self, zone: Zone, status: ZoneStatus) {
        self.state.active_zone = Some(ActiveZone { zone, status });
        self.state.entered_latch = false;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Idle,
    Active,
    Closed,
}

#[derive(Debug)]
pub enum SessionCommand {
    UpdateZone { zone: Zone, reply: oneshot::Sender<ZoneStatus> },
    CurrentPosition { reply: oneshot::Sender<Option<Coordinate>> },
    Shutdown,
}

enum Input {
    Position(PositionUpdate),
    StreamEnded,
    Command(SessionCommand),
    Closed,
}

/// Live containment tracking for one owner.
///
/// Wires a [`LocationSource`] through the [`ContainmentTracker`] into a
/// [`NotificationSink`]. Inputs are handled one at a time, so each sample
/// sees the latches left by the previous one.
pub struct Session<Z, N> {
    owner: String,
    store: Z,
    sink: N,
    selector: Box<dyn SelectZone + Send>,
    watch: WatchOptions,
    tracker: ContainmentTracker,
    subscription: Option<Subscription>,
    lifecycle: Lifecycle,
}

impl<Z: ZoneStore, N: NotificationSink> Session<Z, N> {
    pub fn new(owner: impl Into<String>, store: Z, sink: N, selector: impl SelectZone + Send + 'static) -> Self {
        Self {
            owner: owner.into(),
            store,
            sink,
            selector: Box::new(selector),
            watch: WatchOptions::default(),
            tracker: ContainmentTracker::new(),
            subscription: None,
            lifecycle: Lifecycle::Idle,
        }
    }

    pub fn with_watch_options(mut self, watch: WatchOptions) -> Self {
        self.watch = watch;
        self
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn state(&self) -> &ContainmentState {
        self.tracker.state()
    }

    pub fn phase(&self) -> Containment {
        self.tracker.phase()
    }

    pub fn is_subscribed(&self) -> bool {
        self.subscription.is_some()
    }

    pub fn sink(&self) -> &N {
        &self.sink
    }

    /// Loads the owner's zone, asks for permission once and, if granted,
    /// takes an initial fix and opens the position stream.
    pub async fn activate<L: LocationSource + ?Sized>(&mut self, source: &mut L) {
        if self.lifecycle != Lifecycle::Idle {
            warn!(owner = %self.owner, "session: activate ignored, lifecycle is {:?}", self.lifecycle);
            return;
        }
        self.lifecycle = Lifecycle::Active;
        self.load_zone();

        let granted = source.request_permission().await;
        self.tracker.set_permission(granted);
        if !granted {
            info!(owner = %self.owner, "session: location permission denied; no position updates");
            return;
        }

        match source.current_position().await {
            Ok(pos) => {
                self.handle_update(Ok(pos));
            }
            Err(e) => warn!("session: initial fix failed: {}", e),
        }

        match source.subscribe(self.watch) {
            Ok(sub) => {
                info!(owner = %self.owner, sub = sub.id(), "session: subscribed to position updates");
                self.subscription = Some(sub);
            }
            Err(e) => warn!("session: subscribe failed: {}", e),
        }
    }

    fn load_zone(&mut self) {
        match self.store.load_zones(&self.owner) {
            Ok(zones) => match self.selector.select_active_zone(&zones) {
                Some(zone) => {
                    info!(owner = %self.owner, zone = %zone.id, name = %zone.name, "session: tracking zone");
                    self.tracker.set_zone(zone, ZoneStatus::Confirmed);
                }
                None => info!(owner = %self.owner, stored = zones.len(), "session: no zone selected"),
            },
            Err(e) => warn!(owner = %self.owner, "session: loading zones failed: {}", e),
        }
    }

    /// Applies one position update. Errors are logged and leave the state
    /// untouched. Returns the fired event, if any.
    pub fn handle_update(&mut self, update: PositionUpdate) -> Option<ZoneEvent> {
        if self.lifecycle != Lifecycle::Active || !self.tracker.state().has_location_permission {
            return None;
        }
        let pos = match update {
            Ok(pos) => pos,
            Err(e) => {
                warn!("session: position update failed: {}", e);
                return None;
            }
        };

        let kind = self.tracker.observe(pos);
        debug!(lat = pos.latitude, lon = pos.longitude, inside = self.tracker.state().is_inside, "session: sample");
        let kind = kind?;
        let zone = &self.tracker.state().active_zone.as_ref()?.zone;
        let ev = ZoneEvent::new(now_unix_ms(), kind, zone, pos);
        info!(zone = %ev.zone_id, "session: {:?} {}", ev.kind, ev.zone_name);
        self.sink.notify_event(&ev);
        Some(ev)
    }

    /// Persists `zone` and makes it the active zone. A persistence failure
    /// is logged and the zone is still used, marked pending.
    pub fn update_zone(&mut self, zone: Zone) -> ZoneStatus {
        let status = match self.store.append_zone(&self.owner, &zone) {
            Ok(()) => ZoneStatus::Confirmed,
            Err(e) => {
                warn!(zone = %zone.id, "session: zone not persisted, keeping it pending: {}", e);
                ZoneStatus::Pending
            }
        };
        info!(zone = %zone.id, name = %zone.name, ?status, "session: active zone updated");
        self.tracker.set_zone(zone, status);
        status
    }

    /// Releases the position stream. Safe to call more than once; only the
    /// first call unsubscribes.
    pub fn deactivate<L: LocationSource + ?Sized>(&mut self, source: &mut L) {
        self.lifecycle = Lifecycle::Closed;
        if let Some(sub) = self.subscription.take() {
            info!(sub = sub.id(), "session: unsubscribing from position updates");
            source.unsubscribe(sub);
        }
    }

    /// Runs the session until shutdown, command channel close, end of the
    /// position stream or permission revocation.
    ///
    /// Shutdown is honoured while activation is still pending, so a source
    /// that never grants permission or never yields a first fix cannot pin
    /// the session. Other commands received during activation are applied
    /// once it finishes or is abandoned.
    pub async fn run<L: LocationSource + ?Sized>(&mut self, source: &mut L, mut commands: mpsc::Receiver<SessionCommand>) {
        let mut deferred = Vec::new();
        let activated = {
            let activation = self.activate(source);
            tokio::pin!(activation);
            loop {
                tokio::select! {
                    biased;
                    cmd = commands.recv() => match cmd {
                        Some(SessionCommand::Shutdown) | None => break false,
                        Some(cmd) => deferred.push(cmd),
                    },
                    _ = &mut activation => break true,
                }
            }
        };
        if !activated {
            info!(owner = %self.owner, "session: stopped during activation");
        }
        for cmd in deferred {
            self.apply(cmd);
        }

        while activated {
            match self.next_input(&mut commands).await {
                Input::Position(Err(LocationError::PermissionRevoked)) => {
                    warn!("session: location permission revoked");
                    self.tracker.set_permission(false);
                    break;
                }
                Input::Position(update) => {
                    self.handle_update(update);
                }
                Input::StreamEnded => {
                    info!("session: position stream ended");
                    break;
                }
                Input::Command(SessionCommand::Shutdown) | Input::Closed => break,
                Input::Command(cmd) => self.apply(cmd),
            }
        }

        self.deactivate(source);
    }

    fn apply(&mut self, cmd: SessionCommand) {
        match cmd {
            SessionCommand::UpdateZone { zone, reply } => {
                let status = self.update_zone(zone);
                let _ = reply.send(status);
            }
            SessionCommand::CurrentPosition { reply } => {
                let _ = reply.send(self.tracker.state().current_position);
            }
            SessionCommand::Shutdown => {}
        }
    }

    async fn next_input(&mut self, commands: &mut mpsc::Receiver<SessionCommand>) -> Input {
        match self.subscription.as_mut() {
            Some(sub) => tokio::select! {
                biased;
                cmd = commands.recv() => cmd.map_or(Input::Closed, Input::Command),
                update = sub.next() => update.map_or(Input::StreamEnded, Input::Position),
            },
            None => commands.recv().await.map_or(Input::Closed, Input::Command),
        }
    }
}

/// Sending side of a running [`Session`].
#[derive(Debug, Clone)]
pub struct SessionHandle {
    tx: mpsc::Sender<SessionCommand>,
}

impl SessionHandle {
    pub fn channel(buffer: usize) -> (Self, mpsc::Receiver<SessionCommand>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (Self { tx }, rx)
    }

    pub async fn update_zone(&self, zone: Zone) -> Result<ZoneStatus> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(SessionCommand::UpdateZone { zone, reply }).await
            .ok().context("session is not running")?;
        rx.await.context("session stopped before replying")
    }

    /// Last known position, if any sample has arrived.
    pub async fn current_position(&self) -> Result<Option<Coordinate>> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(SessionCommand::CurrentPosition { reply }).await
            .ok().context("session is not running")?;
        rx.await.context("session stopped before replying")
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.tx.send(SessionCommand::Shutdown).await
            .ok().context("session is not running")
    }
}

fn now_unix_ms() -> i64 {
    (time::OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}
