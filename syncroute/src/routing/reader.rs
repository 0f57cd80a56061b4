use std::collections::VecDeque;

use futures::StreamExt;
use futures::stream::BoxStream;

use crate::error::SyncResult;
use crate::types::CapturedEvent;

/// Reads captured events, making the events of one transaction contiguous.
///
/// Transactions interleave in id order when they commit concurrently. The reader buffers up
/// to `window` events ahead and, once it emits an event of a transaction, emits the buffered
/// events of the same transaction before any other. Events of a transaction further apart
/// than the window may still be split.
pub struct RegroupingReader<'a> {
    events: BoxStream<'a, SyncResult<CapturedEvent>>,
    window: VecDeque<CapturedEvent>,
    capacity: usize,
    current_transaction_id: Option<String>,
    exhausted: bool,
}

impl<'a> RegroupingReader<'a> {
    pub fn new(events: BoxStream<'a, SyncResult<CapturedEvent>>, window: usize) -> Self {
        let capacity = window.max(1);

        Self {
            events,
            window: VecDeque::with_capacity(capacity),
            capacity,
            current_transaction_id: None,
            exhausted: false,
        }
    }

    /// Returns the next event, or `None` once the underlying stream is drained.
    pub async fn next_event(&mut self) -> SyncResult<Option<CapturedEvent>> {
        self.fill().await?;

        let position = self
            .current_transaction_id
            .as_deref()
            .and_then(|current| {
                self.window
                    .iter()
                    .position(|event| event.transaction_id.as_deref() == Some(current))
            })
            .unwrap_or(0);

        let Some(event) = self.window.remove(position) else {
            return Ok(None);
        };
        self.current_transaction_id.clone_from(&event.transaction_id);

        Ok(Some(event))
    }

    async fn fill(&mut self) -> SyncResult<()> {
        while !self.exhausted && self.window.len() < self.capacity {
            match self.events.next().await {
                Some(event) => self.window.push_back(event?),
                None => self.exhausted = true,
            }
        }

        Ok(())
    }
}
