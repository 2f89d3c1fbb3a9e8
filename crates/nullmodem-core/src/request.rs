//! Pending-operation queues and the cancellation engine
//!
//! Every blocking operation on a port (read, write, wait-for-event) is
//! represented by a [`Request`]. A request belongs to exactly one queue and
//! is either `queued` (in the FIFO backlog) or `current` (the single
//! in-service slot). It is completed exactly once, by whichever of the
//! normal completion path, an external cancel or a timeout claims its
//! one-shot completion slot first; the losers of that race become no-ops.
//!
//! Queue and membership state is only ever mutated under the port pair's
//! lock. Completion *outcomes* are collected into a [`Completions`] list
//! inside the critical section and delivered (slot filled, waiters woken)
//! strictly after the lock is released, so a woken thread can immediately
//! re-enter the engine without lock reentrancy.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Instant;

/// Operation kind; each port keeps one queue per kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Kind {
    Read,
    Write,
    Wait,
}

/// How a request ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionStatus {
    /// The operation ran to completion
    Complete,
    /// Claimed by an external cancel
    Cancelled,
    /// Claimed by a deadline; `transferred` holds the partial count
    TimedOut,
}

/// Result delivered to the submitting thread
#[derive(Debug, Clone, Copy)]
pub struct Outcome {
    /// Final status
    pub status: CompletionStatus,
    /// Bytes transferred before the request ended
    pub transferred: usize,
    /// Accumulated event bits, for wait requests
    pub events: u32,
}

/// Operation-specific staging storage
#[derive(Debug)]
pub(crate) enum Payload {
    /// Fills `dest` from the port's receive path; `pos` bytes done so far
    Read { dest: Vec<u8>, pos: usize },
    /// Drains `src` to the peer; `pos` bytes consumed so far
    Write { src: Vec<u8>, pos: usize },
    /// Parked until a waited-for event fires
    Wait,
}

impl Payload {
    pub(crate) fn transferred(&self) -> usize {
        match self {
            Payload::Read { pos, .. } | Payload::Write { pos, .. } => *pos,
            Payload::Wait => 0,
        }
    }
}

/// Queue-membership flags and staging storage; mutated only under the pair
/// lock
#[derive(Debug)]
pub(crate) struct RequestBody {
    pub payload: Payload,
    pub queued: bool,
    pub current: bool,
}

/// One pending operation with an atomically-claimed one-shot completion slot
#[derive(Debug)]
pub(crate) struct Request {
    claimed: AtomicBool,
    outcome: Mutex<Option<Outcome>>,
    ready: Condvar,
    pub(crate) body: Mutex<RequestBody>,
}

impl Request {
    pub(crate) fn new(payload: Payload) -> Arc<Self> {
        Arc::new(Self {
            claimed: AtomicBool::new(false),
            outcome: Mutex::new(None),
            ready: Condvar::new(),
            body: Mutex::new(RequestBody {
                payload,
                queued: false,
                current: false,
            }),
        })
    }

    /// Claim the right to complete this request. Exactly one caller ever
    /// wins; everyone else gets `false` and must back off.
    pub(crate) fn claim(&self) -> bool {
        self.claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Fill the completion slot and wake waiters. Must follow a successful
    /// [`claim`](Self::claim); a second delivery is queue corruption.
    fn deliver(&self, outcome: Outcome) {
        let mut slot = self.outcome.lock().unwrap();
        assert!(slot.is_none(), "request completed twice");
        *slot = Some(outcome);
        self.ready.notify_all();
    }

    /// Block until the outcome is delivered
    pub(crate) fn wait_outcome(&self) -> Outcome {
        let mut slot = self.outcome.lock().unwrap();
        while slot.is_none() {
            slot = self.ready.wait(slot).unwrap();
        }
        slot.unwrap()
    }

    /// Block until delivery or `deadline`; `None` means the deadline passed
    /// first
    pub(crate) fn wait_outcome_until(&self, deadline: Instant) -> Option<Outcome> {
        let mut slot = self.outcome.lock().unwrap();
        loop {
            if let Some(outcome) = *slot {
                return Some(outcome);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, _) = self.ready.wait_timeout(slot, deadline - now).unwrap();
            slot = guard;
        }
    }

    pub(crate) fn try_outcome(&self) -> Option<Outcome> {
        *self.outcome.lock().unwrap()
    }
}

/// Completions collected under the pair lock, delivered after it is released
#[derive(Debug, Default)]
pub(crate) struct Completions {
    list: Vec<(Arc<Request>, Outcome)>,
}

impl Completions {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&mut self, request: Arc<Request>, outcome: Outcome) {
        self.list.push((request, outcome));
    }

    /// Deliver everything collected. Call with no locks held.
    pub(crate) fn deliver(self) {
        for (request, outcome) in self.list {
            tracing::trace!(status = ?outcome.status, transferred = outcome.transferred, "completing request");
            request.deliver(outcome);
        }
    }
}

/// Per-(port, kind) FIFO with a single in-service slot
#[derive(Debug, Default)]
pub(crate) struct RequestQueue {
    current: Option<Arc<Request>>,
    backlog: VecDeque<Arc<Request>>,
}

impl RequestQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn current(&self) -> Option<&Arc<Request>> {
        self.current.as_ref()
    }

    pub(crate) fn is_busy(&self) -> bool {
        self.current.is_some()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.current.is_none() && self.backlog.is_empty()
    }

    /// All live requests, current first
    pub(crate) fn iter(&self) -> impl Iterator<Item = &Arc<Request>> {
        self.current.iter().chain(self.backlog.iter())
    }

    /// Occupy the in-service slot; the queue must be idle
    pub(crate) fn set_current(&mut self, request: Arc<Request>) {
        assert!(self.current.is_none(), "queue already has a current request");
        request.body.lock().unwrap().current = true;
        self.current = Some(request);
    }

    /// Append to the backlog behind the in-service request
    pub(crate) fn push_backlog(&mut self, request: Arc<Request>) {
        request.body.lock().unwrap().queued = true;
        self.backlog.push_back(request);
    }

    /// Clear the in-service slot and promote the backlog head into it, FIFO.
    /// Returns the promoted request so the caller can service it.
    pub(crate) fn shift(&mut self) -> Option<Arc<Request>> {
        if let Some(old) = self.current.take() {
            old.body.lock().unwrap().current = false;
        }
        if let Some(next) = self.backlog.pop_front() {
            let mut body = next.body.lock().unwrap();
            body.queued = false;
            body.current = true;
            drop(body);
            self.current = Some(next.clone());
            Some(next)
        } else {
            None
        }
    }

    /// Remove a backlog entry claimed by a cancel
    pub(crate) fn unlink(&mut self, request: &Arc<Request>) {
        let before = self.backlog.len();
        self.backlog.retain(|r| !Arc::ptr_eq(r, request));
        assert_eq!(before, self.backlog.len() + 1, "request missing from its queue");
        request.body.lock().unwrap().queued = false;
    }

    /// Cancel every live request in the queue (port teardown). Requests
    /// already claimed by a racing completion are left to their claimant.
    pub(crate) fn cancel_all(&mut self, completions: &mut Completions) {
        let drain: Vec<_> = self.current.take().into_iter().chain(self.backlog.drain(..)).collect();
        for request in drain {
            let mut body = request.body.lock().unwrap();
            body.queued = false;
            body.current = false;
            let transferred = body.payload.transferred();
            drop(body);
            if request.claim() {
                completions.push(
                    request,
                    Outcome {
                        status: CompletionStatus::Cancelled,
                        transferred,
                        events: 0,
                    },
                );
            }
        }
    }
}
