//! Bus-backed subscription streams handed out by the backend.

use std::collections::VecDeque;

use kestrel_chain::events::{ChainHeadEvent, LogsEvent};
use kestrel_chain::{FilterQuery, Header, Log};
use kestrel_event::TypedSubscription;

/// A live stream of new canonical heads.
pub struct NewHeadsSubscription {
    sub: TypedSubscription<ChainHeadEvent>,
}

impl NewHeadsSubscription {
    pub(crate) fn new(sub: TypedSubscription<ChainHeadEvent>) -> Self {
        Self { sub }
    }

    /// Next header; `None` once the stream ends.
    pub async fn recv(&mut self) -> Option<Header> {
        self.sub.recv().await.map(|event| event.block.header)
    }

    /// Ends the stream. Idempotent.
    pub fn unsubscribe(&mut self) {
        self.sub.stop();
    }
}

/// A live stream of logs matching a filter query.
///
/// Bus events arrive in per-block batches; this wrapper flattens them into
/// a plain log stream, applying the filter as it goes.
pub struct LogsSubscription {
    sub: TypedSubscription<LogsEvent>,
    query: FilterQuery,
    buffered: VecDeque<Log>,
}

impl LogsSubscription {
    pub(crate) fn new(sub: TypedSubscription<LogsEvent>, query: FilterQuery) -> Self {
        Self { sub, query, buffered: VecDeque::new() }
    }

    /// Next matching log; `None` once the stream ends.
    pub async fn recv(&mut self) -> Option<Log> {
        loop {
            if let Some(log) = self.buffered.pop_front() {
                return Some(log);
            }
            let event = self.sub.recv().await?;
            self.buffered.extend(event.logs.into_iter().filter(|log| self.query.matches(log)));
        }
    }

    /// Ends the stream. Idempotent.
    pub fn unsubscribe(&mut self) {
        self.sub.stop();
    }
}
