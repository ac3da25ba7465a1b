// SPDX-License-Identifier: MIT
//
// Client input handoff — a bounded rendezvous between the connection
// read loop and the session.
//
// Input flows connection → session → editor. The editor can stall (a
// modal prompt blocks its input channel), and an unbounded queue would
// just hide that stall until memory ran out. So the handoff is a
// capacity-1 slot with a send timeout: the read loop offers each frame,
// and if the consumer doesn't take it within the timeout the loop
// abandons the connection. Availability over completeness — a client
// reconnect costs one full resync, a deadlocked read loop costs the
// whole server.
//
// The slot is also the shutdown path: closing it from either side wakes
// whoever is blocked, and the pump exits.

use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, warn};

use vmux_screen::decode::{parse_client_frame, ClientFrame};

use crate::session::Session;

/// How often the pump wakes to check whether the session ended.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

// ─── Errors ──────────────────────────────────────────────────────────────────

/// Why a send did not hand its frame over.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SendError {
    /// The consumer did not drain the slot within the timeout. The
    /// caller should abandon the connection.
    #[error("input consumer did not accept the frame in time")]
    Timeout,
    /// The slot was closed; nobody will ever drain it.
    #[error("input slot is closed")]
    Closed,
}

/// Why a receive returned no frame.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RecvError {
    /// Nothing arrived within the wait.
    #[error("no frame within the timeout")]
    Timeout,
    /// Closed and drained; no more frames will ever arrive.
    #[error("input slot is closed")]
    Closed,
}

// ─── InputSlot ───────────────────────────────────────────────────────────────

struct State<T> {
    slot: Option<T>,
    closed: bool,
}

struct Shared<T> {
    state: Mutex<State<T>>,
    /// Signaled when the slot empties.
    space: Condvar,
    /// Signaled when a frame lands or the slot closes.
    arrival: Condvar,
}

/// A capacity-1 rendezvous with a bounded send.
///
/// Clones share the same slot; typically one clone lives in the
/// connection read loop (sender) and one in the input pump (receiver).
pub struct InputSlot<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for InputSlot<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> Default for InputSlot<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> InputSlot<T> {
    /// Create an empty, open slot.
    #[must_use]
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    slot: None,
                    closed: false,
                }),
                space: Condvar::new(),
                arrival: Condvar::new(),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State<T>> {
        // A poisoned lock means a panicked peer, not corrupt data — the
        // state here is a flag and an Option.
        self.shared
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Offer a frame, waiting at most `timeout` for space.
    ///
    /// # Errors
    ///
    /// [`SendError::Timeout`] when the consumer never drained the slot;
    /// [`SendError::Closed`] when nobody will.
    pub fn send_timeout(&self, value: T, timeout: Duration) -> Result<(), SendError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        loop {
            if state.closed {
                return Err(SendError::Closed);
            }
            if state.slot.is_none() {
                state.slot = Some(value);
                self.shared.arrival.notify_one();
                return Ok(());
            }
            let now = Instant::now();
            let Some(remaining) = deadline.checked_duration_since(now).filter(|d| !d.is_zero())
            else {
                return Err(SendError::Timeout);
            };
            let (guard, result) = self
                .shared
                .space
                .wait_timeout(state, remaining)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            state = guard;
            if result.timed_out() && state.slot.is_some() && !state.closed {
                return Err(SendError::Timeout);
            }
        }
    }

    /// Take the next frame, waiting at most `timeout`.
    ///
    /// # Errors
    ///
    /// [`RecvError::Timeout`] when nothing arrived; [`RecvError::Closed`]
    /// once the slot is closed and drained.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<T, RecvError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        loop {
            if let Some(value) = state.slot.take() {
                self.shared.space.notify_one();
                return Ok(value);
            }
            if state.closed {
                return Err(RecvError::Closed);
            }
            let now = Instant::now();
            let Some(remaining) = deadline.checked_duration_since(now).filter(|d| !d.is_zero())
            else {
                return Err(RecvError::Timeout);
            };
            let (guard, _) = self
                .shared
                .arrival
                .wait_timeout(state, remaining)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            state = guard;
        }
    }

    /// Take the next frame, blocking until one arrives or the slot
    /// closes.
    pub fn recv(&self) -> Option<T> {
        let mut state = self.lock();
        loop {
            if let Some(value) = state.slot.take() {
                self.shared.space.notify_one();
                return Some(value);
            }
            if state.closed {
                return None;
            }
            state = self
                .shared
                .arrival
                .wait(state)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
        }
    }

    /// Close the slot, waking every blocked sender and receiver. A
    /// frame already in the slot can still be drained. Idempotent.
    pub fn close(&self) {
        let mut state = self.lock();
        state.closed = true;
        drop(state);
        self.shared.space.notify_all();
        self.shared.arrival.notify_all();
    }

    /// Whether the slot has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }
}

// ─── Input pump ──────────────────────────────────────────────────────────────

/// Drain client frames from `slot` and forward them to the session's
/// editor until the slot closes, the session ends, or the editor
/// rejects a frame.
///
/// Malformed frames are dropped with a log line; an editor error
/// abandons the connection by closing the slot — the client reconnects
/// and resyncs.
pub fn run_input_pump(slot: &InputSlot<Vec<u8>>, session: &Session) {
    loop {
        if session.is_ended() {
            debug!("session ended, input pump exiting");
            slot.close();
            return;
        }
        match slot.recv_timeout(POLL_INTERVAL) {
            Ok(frame) => match parse_client_frame(&frame) {
                Some(ClientFrame::Keyboard(keys)) => {
                    if let Err(e) = session.input(&keys) {
                        warn!(error = %e, "editor rejected input, abandoning connection");
                        slot.close();
                        return;
                    }
                }
                Some(ClientFrame::Resize { cols, rows }) => {
                    if let Err(e) = session.resize(cols, rows) {
                        warn!(error = %e, "editor rejected resize, abandoning connection");
                        slot.close();
                        return;
                    }
                }
                None => debug!(len = frame.len(), "dropping malformed client frame"),
            },
            Err(RecvError::Timeout) => {}
            Err(RecvError::Closed) => {
                debug!("input slot closed, pump exiting");
                return;
            }
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
