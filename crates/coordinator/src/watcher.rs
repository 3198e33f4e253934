use std::sync::Arc;

use shared::{
    domain::{Phase, PlaceId, RoomCode},
    protocol::RoomSnapshot,
};
use tokio::{
    sync::{mpsc, watch, Notify},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    subscription::{subscribe, ChangeFilter, Subscription},
    RoomCoordinator,
};

const EVENT_BUFFER: usize = 32;

/// Which screen a client should be on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Stage {
    Lobby,
    DrawArea,
    PickPlaces,
    Vote,
    Decided(PlaceId),
}

impl Stage {
    pub fn of(snapshot: &RoomSnapshot) -> Self {
        if let Some(winner) = &snapshot.winner {
            return Stage::Decided(winner.clone());
        }
        match snapshot.room.phase {
            Phase::Lobby => Stage::Lobby,
            Phase::AreaSelection => Stage::DrawArea,
            Phase::PlaceSelection => Stage::PickPlaces,
            Phase::Voting | Phase::Resolved => Stage::Vote,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RoomEvent {
    /// Emitted once per distinct stage, however many signals observed it.
    StageChanged(Stage),
    /// Reported once per outage; the next successful refresh re-arms it.
    RefreshFailed(String),
}

/// Keeps one client's view of a room converged with the store.
///
/// Every change signal for the room wakes the refresh loop, which re-reads the
/// whole room and derives readiness and the winner from scratch. Bursts of
/// signals collapse into a single refresh. When the fresh view shows that
/// everyone is ready, or that a place has every vote, the loop fires the
/// matching phase transition; those transitions are conditional updates, so
/// every client firing them is harmless.
pub struct RoomWatcher {
    snapshots: watch::Receiver<Option<RoomSnapshot>>,
    events: mpsc::Receiver<RoomEvent>,
    wake: Arc<Notify>,
    subscription: Option<Subscription>,
    task: Option<JoinHandle<()>>,
}

impl RoomWatcher {
    pub fn spawn(coordinator: RoomCoordinator, code: RoomCode) -> Self {
        let wake = Arc::new(Notify::new());
        let subscription = {
            let wake = Arc::clone(&wake);
            subscribe(
                coordinator.store().as_ref(),
                ChangeFilter::room(code.clone()),
                move || wake.notify_one(),
            )
        };
        wake.notify_one();

        let (snapshot_tx, snapshots) = watch::channel(None);
        let (events_tx, events) = mpsc::channel(EVENT_BUFFER);
        let task = tokio::spawn(refresh_loop(
            coordinator,
            code,
            Arc::clone(&wake),
            snapshot_tx,
            events_tx,
        ));

        Self {
            snapshots,
            events,
            wake,
            subscription: Some(subscription),
            task: Some(task),
        }
    }

    pub fn snapshots(&self) -> watch::Receiver<Option<RoomSnapshot>> {
        self.snapshots.clone()
    }

    pub fn latest(&self) -> Option<RoomSnapshot> {
        self.snapshots.borrow().clone()
    }

    pub async fn next_event(&mut self) -> Option<RoomEvent> {
        self.events.recv().await
    }

    /// Forces a re-read, e.g. after reconnecting to the store.
    pub fn refresh(&self) {
        self.wake.notify_one();
    }

    pub async fn shutdown(mut self) {
        if let Some(subscription) = self.subscription.take() {
            subscription.unsubscribe().await;
        }
        if let Some(task) = self.task.take() {
            task.abort();
            let _ = task.await;
        }
    }
}

impl Drop for RoomWatcher {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn refresh_loop(
    coordinator: RoomCoordinator,
    code: RoomCode,
    wake: Arc<Notify>,
    snapshot_tx: watch::Sender<Option<RoomSnapshot>>,
    events_tx: mpsc::Sender<RoomEvent>,
) {
    let mut last_stage: Option<Stage> = None;
    let mut failing = false;
    loop {
        wake.notified().await;
        let snapshot = match coordinator.snapshot(&code).await {
            Ok(snapshot) => snapshot,
            Err(err) => {
                warn!(room_code = %code, %err, "room refresh failed");
                if !failing {
                    failing = true;
                    emit(&events_tx, &code, RoomEvent::RefreshFailed(err.to_string()));
                }
                continue;
            }
        };
        failing = false;

        if snapshot.room.phase == Phase::PlaceSelection && snapshot.readiness.all_ready {
            match coordinator.advance_to_voting(&code).await {
                Ok(advanced) => debug!(room_code = %code, advanced, "everyone ready"),
                Err(err) => warn!(room_code = %code, %err, "advance to voting failed"),
            }
        }
        if snapshot.room.phase == Phase::Voting && snapshot.winner.is_some() {
            match coordinator.mark_resolved(&code).await {
                Ok(resolved) => debug!(room_code = %code, resolved, "unanimous vote"),
                Err(err) => warn!(room_code = %code, %err, "resolving room failed"),
            }
        }

        let stage = Stage::of(&snapshot);
        if last_stage.as_ref() != Some(&stage) {
            info!(room_code = %code, ?stage, "room stage changed");
            last_stage = Some(stage.clone());
            emit(&events_tx, &code, RoomEvent::StageChanged(stage));
        }
        snapshot_tx.send_replace(Some(snapshot));
    }
}

/// Never blocks the refresh loop; the latest snapshot stays readable through
/// the watch channel even when events are dropped.
fn emit(events_tx: &mpsc::Sender<RoomEvent>, code: &RoomCode, event: RoomEvent) {
    if let Err(mpsc::error::TrySendError::Full(event)) = events_tx.try_send(event) {
        debug!(room_code = %code, ?event, "event buffer full; dropping event");
    }
}

#[cfg(test)]
#[path = "tests/watcher_tests.rs"]
mod tests;
