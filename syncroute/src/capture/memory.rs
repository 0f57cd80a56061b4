use std::collections::BTreeMap;
use std::sync::Arc;

use futures::StreamExt;
use futures::stream::{self, BoxStream};
use tokio::sync::Mutex;

use crate::capture::{CaptureSource, TransactionVisibility};
use crate::error::{ErrorKind, SyncResult};
use crate::sync_error;
use crate::types::{CapturedEvent, EventId};

#[derive(Debug)]
struct Inner {
    events: BTreeMap<EventId, CapturedEvent>,
    /// Highest id handed out, which may exceed the highest visible event.
    high_water_id: Option<EventId>,
    visibility: TransactionVisibility,
    /// Reads reaching this id fail.
    unreadable_from: Option<EventId>,
}

/// Capture source backed by an ordered map.
///
/// Ids can be reserved without an event to model transactions that commit later than events
/// with higher ids.
#[derive(Debug, Clone)]
pub struct MemoryCaptureSource {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryCaptureSource {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                events: BTreeMap::new(),
                high_water_id: None,
                visibility: TransactionVisibility::Unsupported,
                unreadable_from: None,
            })),
        }
    }

    /// Makes an event visible and raises the high-water id to its id.
    pub async fn push(&self, event: CapturedEvent) {
        let mut inner = self.inner.lock().await;
        inner.high_water_id = Some(inner.high_water_id.map_or(event.id, |id| id.max(event.id)));
        inner.events.insert(event.id, event);
    }

    /// Raises the high-water id without making an event visible.
    pub async fn reserve_id(&self, id: EventId) {
        let mut inner = self.inner.lock().await;
        inner.high_water_id = Some(inner.high_water_id.map_or(id, |current| current.max(id)));
    }

    pub async fn set_transaction_visibility(&self, visibility: TransactionVisibility) {
        self.inner.lock().await.visibility = visibility;
    }

    /// Makes every stream fail once it reaches `id`, until cleared with `None`.
    pub async fn set_unreadable_from(&self, id: Option<EventId>) {
        self.inner.lock().await.unreadable_from = id;
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.events.len()
    }
}

impl Default for MemoryCaptureSource {
    fn default() -> Self {
        Self::new()
    }
}

impl CaptureSource for MemoryCaptureSource {
    fn stream_events(
        &self,
        from_id: EventId,
        to_id: EventId,
    ) -> BoxStream<'_, SyncResult<CapturedEvent>> {
        let inner = self.inner.clone();

        stream::once(async move {
            let inner = inner.lock().await;
            let events: Vec<SyncResult<CapturedEvent>> = if from_id > to_id {
                Vec::new()
            } else {
                let mut events = Vec::new();
                for (id, event) in inner.events.range(from_id..=to_id) {
                    if inner.unreadable_from.is_some_and(|unreadable| *id >= unreadable) {
                        events.push(Err(sync_error!(
                            ErrorKind::CaptureReadFailed,
                            "Failed to read captured events",
                            format!("event {id} is unreadable")
                        )));
                        break;
                    }
                    events.push(Ok(event.clone()));
                }
                events
            };
            stream::iter(events)
        })
        .flatten()
        .boxed()
    }

    async fn current_high_water_id(&self) -> SyncResult<Option<EventId>> {
        Ok(self.inner.lock().await.high_water_id)
    }

    async fn transaction_visibility(&self) -> SyncResult<TransactionVisibility> {
        Ok(self.inner.lock().await.visibility)
    }
}
