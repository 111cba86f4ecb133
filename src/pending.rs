#![cfg(feature = "stack-api")]

// Pending request tracker: correlates outbound requests with inbound
// responses by request id and enforces a deadline per request.

use std::time::{Duration, Instant};

use ahash::AHashMap;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::debug;

use crate::{api::CloseReason, chunk::Message};

/// Errors returned while registering a request.
#[derive(Debug, Error)]
pub enum PendingError {
    /// The per-channel outstanding request cap was reached.
    #[error("too many pending requests (max {max})")]
    TooManyPendingRequests {
        /// Configured outstanding request limit.
        max: u32,
    },
    /// The tracker was dropped before the request resolved.
    #[error("request tracker dropped before resolution")]
    TrackerDropped,
}

/// Terminal result of one tracked request. Each request resolves exactly once.
#[derive(Debug)]
pub enum RequestOutcome {
    /// The matching response arrived.
    Response(Message),
    /// The deadline elapsed first. The channel stays open; repeated timeouts
    /// are a policy decision left to the caller.
    Timeout,
    /// The owning channel closed before a response arrived.
    ChannelLost(CloseReason),
}

/// Receiving side of one tracked request. Await it, poll it, or peek with
/// [`ResponseSlot::try_take`], at the caller's choice.
#[derive(Debug)]
pub struct ResponseSlot {
    rx: oneshot::Receiver<RequestOutcome>,
}

impl ResponseSlot {
    /// Waits for the request to resolve.
    pub async fn recv(self) -> Result<RequestOutcome, PendingError> {
        self.rx.await.map_err(|_recv| PendingError::TrackerDropped)
    }

    /// Returns the outcome if already resolved, without waiting.
    pub fn try_take(&mut self) -> Result<Option<RequestOutcome>, PendingError> {
        match self.rx.try_recv() {
            Ok(outcome) => Ok(Some(outcome)),
            Err(oneshot::error::TryRecvError::Empty) => Ok(None),
            Err(oneshot::error::TryRecvError::Closed) => Err(PendingError::TrackerDropped),
        }
    }
}

#[derive(Debug)]
struct Pending {
    deadline: Instant,
    tx: oneshot::Sender<RequestOutcome>,
}

/// Per-channel registry of outstanding requests.
#[derive(Debug)]
pub struct PendingTracker {
    entries: AHashMap<u32, Pending>,
    next_request_id: u32,
    max_pending: u32,
}

impl PendingTracker {
    /// Creates a tracker bounded by the configured outstanding request cap.
    pub fn new(max_pending: u32) -> Self {
        Self {
            entries: AHashMap::new(),
            next_request_id: 1,
            max_pending,
        }
    }

    /// Number of currently outstanding requests.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no request is outstanding.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// True when the id belongs to an outstanding request.
    pub fn contains(&self, request_id: u32) -> bool {
        self.entries.contains_key(&request_id)
    }

    /// Registers a new request with deadline `now + timeout` and returns its
    /// id together with the caller's response slot.
    pub fn begin(
        &mut self,
        now: Instant,
        timeout: Duration,
    ) -> Result<(u32, ResponseSlot), PendingError> {
        if self.entries.len() >= self.max_pending as usize {
            return Err(PendingError::TooManyPendingRequests {
                max: self.max_pending,
            });
        }

        let request_id = self.allocate_id();
        let (tx, rx) = oneshot::channel();
        self.entries.insert(
            request_id,
            Pending {
                deadline: now + timeout,
                tx,
            },
        );
        Ok((request_id, ResponseSlot { rx }))
    }

    // Ids are unique per channel while outstanding; zero is never used.
    fn allocate_id(&mut self) -> u32 {
        loop {
            let id = self.next_request_id;
            self.next_request_id = self.next_request_id.checked_add(1).unwrap_or(1);
            if !self.entries.contains_key(&id) {
                return id;
            }
        }
    }

    /// Resolves the matching request with a response. Returns `false` for an
    /// unknown or already-resolved id; the caller logs and drops those.
    pub fn complete(&mut self, request_id: u32, message: Message) -> bool {
        match self.entries.remove(&request_id) {
            Some(pending) => {
                // A dropped slot means the caller lost interest; resolution
                // still counts as exactly-once.
                let _ = pending.tx.send(RequestOutcome::Response(message));
                true
            }
            None => {
                debug!(request_id, "response without matching pending request");
                false
            }
        }
    }

    /// Withdraws a request without resolving it, for when the send itself
    /// failed and the caller never hands out the response slot.
    pub fn cancel(&mut self, request_id: u32) -> bool {
        self.entries.remove(&request_id).is_some()
    }

    /// Resolves every request whose deadline has passed with a timeout.
    /// Returns the number of requests timed out.
    pub fn sweep(&mut self, now: Instant) -> usize {
        let overdue: Vec<u32> = self
            .entries
            .iter()
            .filter(|(_, pending)| pending.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in &overdue {
            if let Some(pending) = self.entries.remove(id) {
                debug!(request_id = id, "pending request timed out");
                let _ = pending.tx.send(RequestOutcome::Timeout);
            }
        }
        overdue.len()
    }

    /// Resolves every outstanding request with a channel loss. Runs
    /// synchronously within the close step so no stale continuation fires
    /// afterwards. Returns the number of requests failed.
    pub fn fail_all(&mut self, reason: CloseReason) -> usize {
        let count = self.entries.len();
        for (_, pending) in self.entries.drain() {
            let _ = pending.tx.send(RequestOutcome::ChannelLost(reason));
        }
        count
    }
}
