use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

use zw_proto::{Coordinate, EventKind, Zone};
use zw_store::{KvZoneStore, MemoryKv, StoreError, ZoneStore};
use zw_track::location::PositionUpdate;
use zw_track::notify::MemorySink;
use zw_track::{Containment, LocationError, LocationSource, Session, SessionCommand, SessionHandle, Subscription, WatchOptions, ZoneSelector, ZoneStatus};

const CENTER: Coordinate = Coordinate::new(0.0, 0.0);
const FAR: Coordinate = Coordinate::new(1.0, 1.0);

fn zone(id: &str, radius_m: f64) -> Zone {
    Zone::new(id.into(), id, CENTER, radius_m)
}

struct FakeSource {
    grant: bool,
    initial: Option<Coordinate>,
    sub: Option<Subscription>,
    seen_opts: Option<WatchOptions>,
    unsubscribed: Arc<AtomicUsize>,
}

impl FakeSource {
    fn new(grant: bool, initial: Option<Coordinate>) -> (Self, mpsc::Sender<PositionUpdate>, Arc<AtomicUsize>) {
        let (tx, sub) = Subscription::channel(1, 16);
        let unsubscribed = Arc::new(AtomicUsize::new(0));
        let src = Self { grant, initial, sub: Some(sub), seen_opts: None, unsubscribed: unsubscribed.clone() };
        (src, tx, unsubscribed)
    }
}

#[async_trait]
impl LocationSource for FakeSource {
    async fn request_permission(&mut self) -> bool {
        self.grant
    }

    async fn current_position(&mut self) -> Result<Coordinate, LocationError> {
        self.initial.ok_or_else(|| LocationError::Unavailable("no fix yet".into()))
    }

    fn subscribe(&mut self, opts: WatchOptions) -> Result<Subscription, LocationError> {
        self.seen_opts = Some(opts);
        self.sub.take().ok_or(LocationError::Busy("already subscribed"))
    }

    fn unsubscribe(&mut self, sub: Subscription) {
        self.unsubscribed.fetch_add(1, Ordering::SeqCst);
        sub.cancel();
    }
}

/// Grants permission but never produces a first fix.
struct HangingSource {
    unsubscribed: Arc<AtomicUsize>,
}

#[async_trait]
impl LocationSource for HangingSource {
    async fn request_permission(&mut self) -> bool {
        true
    }

    async fn current_position(&mut self) -> Result<Coordinate, LocationError> {
        std::future::pending().await
    }

    fn subscribe(&mut self, _opts: WatchOptions) -> Result<Subscription, LocationError> {
        Err(LocationError::Busy("never reached"))
    }

    fn unsubscribe(&mut self, sub: Subscription) {
        self.unsubscribed.fetch_add(1, Ordering::SeqCst);
        sub.cancel();
    }
}

struct FailingStore;

impl ZoneStore for FailingStore {
    fn load_zones(&self, _owner: &str) -> Result<Vec<Zone>, StoreError> {
        Ok(Vec::new())
    }

    fn append_zone(&self, _owner: &str, _zone: &Zone) -> Result<(), StoreError> {
        Err(StoreError::Io {
            path: "zones.json".into(),
            source: std::io::Error::new(std::io::ErrorKind::Other, "disk full"),
        })
    }
}

fn store_with(zones: &[Zone]) -> KvZoneStore<MemoryKv> {
    let store = KvZoneStore::new(MemoryKv::new());
    for z in zones {
        store.append_zone("admin", z).unwrap();
    }
    store
}

async fn wait_for(mut cond: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !cond() {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("condition not reached");
}

#[tokio::test]
async fn initial_fix_inside_fires_entry_once() {
    let sink = MemorySink::new();
    let (mut src, _tx, _) = FakeSource::new(true, Some(CENTER));
    let mut session = Session::new("admin", store_with(&[zone("z", 100.0)]), sink.clone(), ZoneSelector::Latest);

    session.activate(&mut src).await;
    assert!(session.state().has_location_permission);
    assert!(session.is_subscribed());
    assert_eq!(src.seen_opts, Some(WatchOptions { high_accuracy: true, min_distance_m: 1.0 }));
    assert_eq!(sink.kinds(), vec![EventKind::Entered]);

    assert!(session.handle_update(Ok(CENTER)).is_none());
    assert_eq!(sink.len(), 1);

    let ev = session.handle_update(Ok(FAR)).unwrap();
    assert_eq!(ev.kind, EventKind::Exited);
    assert_eq!(ev.body, "You left z");
    assert_eq!(session.phase(), Containment::Outside);
}

#[tokio::test]
async fn zone_selection_policy_is_applied_on_activation() {
    let (mut src, _tx, _) = FakeSource::new(true, None);
    let store = store_with(&[zone("first", 10.0), zone("second", 20.0)]);
    let mut session = Session::new("admin", store, MemorySink::new(), |zs: &[Zone]| zs.first().cloned());
    session.activate(&mut src).await;
    let active = session.state().active_zone.as_ref().unwrap();
    assert_eq!(active.zone.id.as_str(), "first");
    assert_eq!(active.status, ZoneStatus::Confirmed);
    // no initial fix: position stays unknown
    assert_eq!(session.state().current_position, None);
}

#[tokio::test]
async fn denied_permission_keeps_the_session_inert() {
    let sink = MemorySink::new();
    let (mut src, _tx, unsubscribed) = FakeSource::new(false, Some(CENTER));
    let mut session = Session::new("admin", store_with(&[zone("z", 100.0)]), sink.clone(), ZoneSelector::Latest);

    session.activate(&mut src).await;
    assert!(!session.state().has_location_permission);
    assert!(!session.is_subscribed());
    assert!(src.seen_opts.is_none());

    assert!(session.handle_update(Ok(CENTER)).is_none());
    assert!(sink.is_empty());
    assert_eq!(session.state().current_position, None);

    session.deactivate(&mut src);
    assert_eq!(unsubscribed.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn stream_errors_leave_state_untouched() {
    let (mut src, _tx, _) = FakeSource::new(true, Some(CENTER));
    let mut session = Session::new("admin", store_with(&[zone("z", 100.0)]), MemorySink::new(), ZoneSelector::Latest);
    session.activate(&mut src).await;

    let before = session.state().clone();
    assert!(session.handle_update(Err(LocationError::Unavailable("timeout".into()))).is_none());
    let after = session.state();
    assert_eq!(after.current_position, before.current_position);
    assert_eq!(after.is_inside, before.is_inside);
    assert_eq!(after.entered_latch, before.entered_latch);
    assert_eq!(after.exited_latch, before.exited_latch);
}

#[tokio::test]
async fn update_zone_persists_and_rearms_entry() {
    let (mut src, _tx, _) = FakeSource::new(true, Some(CENTER));
    let store = store_with(&[zone("old", 100.0)]);
    let mut session = Session::new("admin", store.clone(), MemorySink::new(), ZoneSelector::Latest);
    session.activate(&mut src).await;
    assert!(session.state().entered_latch && !session.state().exited_latch);

    let status = session.update_zone(zone("new", 200.0));
    assert_eq!(status, ZoneStatus::Confirmed);
    let st = session.state();
    assert!(!st.entered_latch && !st.exited_latch);
    assert_eq!(st.active_zone.as_ref().unwrap().zone.id.as_str(), "new");
    assert_eq!(store.load_zones("admin").unwrap().len(), 2);

    let ev = session.handle_update(Ok(CENTER)).unwrap();
    assert_eq!(ev.kind, EventKind::Entered);
    assert_eq!(ev.zone_id.as_str(), "new");
}

#[tokio::test]
async fn failed_persistence_keeps_the_zone_pending() {
    let (mut src, _tx, _) = FakeSource::new(true, None);
    let mut session = Session::new("admin", FailingStore, MemorySink::new(), ZoneSelector::Latest);
    session.activate(&mut src).await;
    assert!(session.state().active_zone.is_none());

    assert_eq!(session.update_zone(zone("z", 50.0)), ZoneStatus::Pending);
    let active = session.state().active_zone.as_ref().unwrap();
    assert_eq!(active.status, ZoneStatus::Pending);
    assert!(session.handle_update(Ok(CENTER)).is_some());
}

#[tokio::test]
async fn deactivate_unsubscribes_exactly_once() {
    let sink = MemorySink::new();
    let (mut src, tx, unsubscribed) = FakeSource::new(true, Some(CENTER));
    let mut session = Session::new("admin", store_with(&[zone("z", 100.0)]), sink.clone(), ZoneSelector::Latest);
    session.activate(&mut src).await;

    session.deactivate(&mut src);
    session.deactivate(&mut src);
    assert_eq!(unsubscribed.load(Ordering::SeqCst), 1);
    assert!(tx.is_closed());
    assert!(!session.is_subscribed());

    assert!(session.handle_update(Ok(FAR)).is_none());
    assert_eq!(sink.kinds(), vec![EventKind::Entered]);

    // a closed session cannot be re-armed
    session.activate(&mut src).await;
    assert!(!session.is_subscribed());
}

#[tokio::test]
async fn dropping_the_session_releases_the_stream() {
    let (mut src, tx, _) = FakeSource::new(true, None);
    let mut session = Session::new("admin", store_with(&[]), MemorySink::new(), ZoneSelector::Latest);
    session.activate(&mut src).await;
    assert!(!tx.is_closed());
    drop(session);
    assert!(tx.is_closed());
}

#[tokio::test]
async fn run_processes_stream_and_commands_until_shutdown() {
    let sink = MemorySink::new();
    let (mut src, tx, unsubscribed) = FakeSource::new(true, Some(FAR));
    let store = store_with(&[zone("z", 100.0)]);
    let mut session = Session::new("admin", store.clone(), sink.clone(), ZoneSelector::Latest);
    let (handle, commands) = SessionHandle::channel(4);

    let driver = async {
        wait_for(|| sink.len() == 1).await;
        tx.send(Ok(FAR)).await.unwrap();
        tx.send(Err(LocationError::Unavailable("glitch".into()))).await.unwrap();
        tx.send(Ok(CENTER)).await.unwrap();
        wait_for(|| sink.len() == 2).await;

        let status = handle.update_zone(zone("bigger", 500.0)).await.unwrap();
        assert_eq!(status, ZoneStatus::Confirmed);
        tx.send(Ok(CENTER)).await.unwrap();
        wait_for(|| sink.len() == 3).await;

        handle.shutdown().await.unwrap();
    };

    tokio::join!(session.run(&mut src, commands), driver);

    assert_eq!(sink.kinds(), vec![EventKind::Exited, EventKind::Entered, EventKind::Entered]);
    assert_eq!(unsubscribed.load(Ordering::SeqCst), 1);
    assert!(tx.is_closed());
    assert_eq!(store.load_zones("admin").unwrap().len(), 2);
    assert!(handle.shutdown().await.is_err());
}

#[tokio::test]
async fn run_stops_when_permission_is_revoked() {
    let (mut src, tx, unsubscribed) = FakeSource::new(true, None);
    let mut session = Session::new("admin", store_with(&[zone("z", 100.0)]), MemorySink::new(), ZoneSelector::Latest);
    let (_handle, commands) = SessionHandle::channel(1);

    tx.send(Err(LocationError::PermissionRevoked)).await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), session.run(&mut src, commands)).await.unwrap();

    assert!(!session.state().has_location_permission);
    assert_eq!(unsubscribed.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn run_stops_when_the_stream_ends() {
    let (mut src, tx, unsubscribed) = FakeSource::new(true, None);
    let mut session = Session::new("admin", store_with(&[zone("z", 100.0)]), MemorySink::new(), ZoneSelector::Latest);
    let (_handle, commands) = SessionHandle::channel(1);

    drop(tx);
    tokio::time::timeout(Duration::from_secs(5), session.run(&mut src, commands)).await.unwrap();
    assert_eq!(unsubscribed.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn denied_run_still_accepts_zone_updates_until_closed() {
    let (mut src, _tx, _) = FakeSource::new(false, None);
    let store = store_with(&[]);
    let mut session = Session::new("admin", store.clone(), MemorySink::new(), ZoneSelector::Latest);
    let (handle, commands) = SessionHandle::channel(1);

    let driver = async move {
        assert_eq!(handle.update_zone(zone("z", 10.0)).await.unwrap(), ZoneStatus::Confirmed);
        drop(handle);
    };
    tokio::join!(session.run(&mut src, commands), driver);

    assert_eq!(store.load_zones("admin").unwrap().len(), 1);
    assert!(session.sink().is_empty());
}

#[tokio::test]
async fn shutdown_is_honoured_while_the_first_fix_hangs() {
    let mut src = HangingSource { unsubscribed: Arc::new(AtomicUsize::new(0)) };
    let mut session = Session::new("admin", store_with(&[zone("z", 100.0)]), MemorySink::new(), ZoneSelector::Latest);
    let (handle, commands) = SessionHandle::channel(1);

    handle.shutdown().await.unwrap();
    tokio::time::timeout(Duration::from_secs(2), session.run(&mut src, commands))
        .await
        .expect("run did not return while activation was pending");

    assert!(!session.is_subscribed());
    assert_eq!(src.unsubscribed.load(Ordering::SeqCst), 0);
    assert!(handle.shutdown().await.is_err());
}

#[tokio::test]
async fn closing_the_handle_aborts_a_hanging_activation() {
    let mut src = HangingSource { unsubscribed: Arc::new(AtomicUsize::new(0)) };
    let mut session = Session::new("admin", store_with(&[]), MemorySink::new(), ZoneSelector::Latest);
    let (handle, commands) = SessionHandle::channel(1);

    drop(handle);
    tokio::time::timeout(Duration::from_secs(2), session.run(&mut src, commands)).await.unwrap();
}

#[tokio::test]
async fn zone_updates_sent_during_activation_are_applied() {
    let mut src = HangingSource { unsubscribed: Arc::new(AtomicUsize::new(0)) };
    let store = store_with(&[]);
    let mut session = Session::new("admin", store.clone(), MemorySink::new(), ZoneSelector::Latest);
    let (tx, commands) = mpsc::channel(4);

    let (reply, status) = oneshot::channel();
    tx.send(SessionCommand::UpdateZone { zone: zone("late", 30.0), reply }).await.unwrap();
    let (reply, position) = oneshot::channel();
    tx.send(SessionCommand::CurrentPosition { reply }).await.unwrap();
    tx.send(SessionCommand::Shutdown).await.unwrap();

    tokio::time::timeout(Duration::from_secs(2), session.run(&mut src, commands)).await.unwrap();

    assert_eq!(status.await.unwrap(), ZoneStatus::Confirmed);
    assert_eq!(position.await.unwrap(), None);
    assert_eq!(store.load_zones("admin").unwrap()[0].id.as_str(), "late");
    assert_eq!(session.state().active_zone.as_ref().unwrap().zone.id.as_str(), "late");
}

#[tokio::test]
async fn handle_reports_the_last_known_position() {
    let (mut src, tx, _) = FakeSource::new(true, Some(FAR));
    let mut session = Session::new("admin", store_with(&[zone("z", 100.0)]), MemorySink::new(), ZoneSelector::Latest);
    let (handle, commands) = SessionHandle::channel(4);

    let driver = async {
        assert_eq!(handle.current_position().await.unwrap(), Some(FAR));
        tx.send(Ok(CENTER)).await.unwrap();
        let mut seen = None;
        for _ in 0..100 {
            seen = handle.current_position().await.unwrap();
            if seen == Some(CENTER) {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(seen, Some(CENTER));
        handle.shutdown().await.unwrap();
    };
    tokio::join!(session.run(&mut src, commands), driver);
}
