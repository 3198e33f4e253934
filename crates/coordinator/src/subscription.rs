use shared::{
    domain::RoomCode,
    protocol::{ChangeSignal, StoreTable},
};
use tokio::task::JoinHandle;
use tokio_stream::{wrappers::errors::BroadcastStreamRecvError, wrappers::BroadcastStream, StreamExt};
use tracing::debug;

use crate::store::SharedStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeFilter {
    pub room_code: RoomCode,
    pub tables: Vec<StoreTable>,
}

impl ChangeFilter {
    pub fn room(room_code: RoomCode) -> Self {
        Self {
            room_code,
            tables: StoreTable::ALL.to_vec(),
        }
    }

    pub fn tables(room_code: RoomCode, tables: &[StoreTable]) -> Self {
        Self {
            room_code,
            tables: tables.to_vec(),
        }
    }

    pub fn matches(&self, signal: &ChangeSignal) -> bool {
        signal.room_code == self.room_code && self.tables.contains(&signal.table)
    }
}

/// Live subscription to the change feed. Dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    task: Option<JoinHandle<()>>,
}

impl Subscription {
    pub fn is_active(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Stops delivery and waits until the listener task is gone; no callback
    /// runs after this returns.
    pub async fn unsubscribe(mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            let _ = task.await;
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Calls `on_signal` whenever the store reports a change matching `filter`.
///
/// The callback gets no payload: it means "re-read". Falling behind the feed
/// counts as a change as well. The receiver is taken before this returns, so
/// no change made after the call is missed.
pub fn subscribe<F>(store: &dyn SharedStore, filter: ChangeFilter, mut on_signal: F) -> Subscription
where
    F: FnMut() + Send + 'static,
{
    let mut signals = BroadcastStream::new(store.changes());
    let task = tokio::spawn(async move {
        while let Some(item) = signals.next().await {
            match item {
                Ok(signal) if filter.matches(&signal) => on_signal(),
                Ok(_) => {}
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    debug!(room_code = %filter.room_code, skipped, "change feed lagged");
                    on_signal();
                }
            }
        }
    });
    Subscription { task: Some(task) }
}

#[cfg(test)]
#[path = "tests/subscription_tests.rs"]
mod tests;
