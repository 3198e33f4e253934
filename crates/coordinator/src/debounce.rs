use std::{future::Future, time::Duration};

use shared::{domain::{RoomCode, UserId}, geo::AreaPolygon};
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, warn};

use crate::{
    error::{CoordinatorError, Result},
    RoomCoordinator, RoomRules,
};

/// Coalesces bursts of values into one write per quiet period.
///
/// Every pushed value restarts the timer; only the last value of a burst is
/// flushed. Dropping the debouncer cancels a pending flush.
pub struct Debouncer<T> {
    tx: Option<mpsc::UnboundedSender<T>>,
    task: Option<JoinHandle<()>>,
}

impl<T: Send + 'static> Debouncer<T> {
    pub fn spawn<F, Fut>(quiet: Duration, mut flush: F) -> Self
    where
        F: FnMut(T) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<T>();
        let task = tokio::spawn(async move {
            while let Some(mut pending) = rx.recv().await {
                loop {
                    tokio::select! {
                        next = rx.recv() => match next {
                            Some(value) => pending = value,
                            None => {
                                flush(pending).await;
                                return;
                            }
                        },
                        _ = tokio::time::sleep(quiet) => {
                            flush(pending).await;
                            break;
                        }
                    }
                }
            }
        });
        Self {
            tx: Some(tx),
            task: Some(task),
        }
    }

    /// Returns `false` once the debouncer has shut down.
    pub fn push(&self, value: T) -> bool {
        self.tx.as_ref().is_some_and(|tx| tx.send(value).is_ok())
    }

    /// Flushes any pending value right away and waits for it to be written.
    pub async fn close(mut self) {
        self.tx.take();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl<T> Drop for Debouncer<T> {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// The owner's drawing session for a room's search area.
///
/// Each edit is validated immediately; valid edits are persisted through a
/// [`Debouncer`] so a drag of many vertices becomes a single write.
pub struct AreaEditor {
    code: RoomCode,
    rules: RoomRules,
    writes: Debouncer<Option<AreaPolygon>>,
}

impl AreaEditor {
    pub(crate) fn new(coordinator: RoomCoordinator, code: RoomCode, caller: UserId) -> Self {
        let rules = coordinator.rules().clone();
        let editor_code = code.clone();
        let writes = Debouncer::spawn(rules.area_debounce, move |area: Option<AreaPolygon>| {
            let coordinator = coordinator.clone();
            let code = code.clone();
            async move {
                let outcome = match &area {
                    Some(polygon) => coordinator
                        .write_area_polygon(&code, caller, polygon)
                        .await
                        .map(|write| write.saved),
                    None => coordinator.clear_area_polygon(&code, caller).await,
                };
                match outcome {
                    Ok(true) => debug!(room_code = %code, cleared = area.is_none(), "area saved"),
                    Ok(false) => debug!(room_code = %code, "area write ignored: caller is not the owner"),
                    Err(err) => warn!(room_code = %code, %err, "area write failed"),
                }
            }
        });
        Self {
            code: editor_code,
            rules,
            writes,
        }
    }

    /// Validates `polygon` and schedules it for saving. Returns its area in km².
    /// An oversized polygon is rejected here and never reaches the store.
    pub fn set_area_polygon(&self, polygon: AreaPolygon) -> Result<f64> {
        let area_km2 = self.rules.check_area(&polygon)?;
        self.schedule(Some(polygon))?;
        Ok(area_km2)
    }

    pub fn clear(&self) -> Result<()> {
        self.schedule(None)
    }

    fn schedule(&self, area: Option<AreaPolygon>) -> Result<()> {
        if self.writes.push(area) {
            return Ok(());
        }
        warn!(room_code = %self.code, "area edit dropped: writer has stopped");
        Err(CoordinatorError::EditorClosed)
    }

    /// Saves the last pending edit without waiting for the quiet period.
    pub async fn finish(self) {
        self.writes.close().await;
    }
}

#[cfg(test)]
#[path = "tests/debounce_tests.rs"]
mod tests;
