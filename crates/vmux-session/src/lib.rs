// SPDX-License-Identifier: MIT
//
// vmux-session — session objects for vmux.
//
// Wraps one screen, one editor handle, and at most one attached sink
// into an explicit session value: no global registries, no singletons.
// Also owns the client input path — a capacity-1 handoff with a send
// timeout, so a stalled editor abandons one connection instead of
// deadlocking the server.

pub mod input;
pub mod session;

pub use input::{run_input_pump, InputSlot, RecvError, SendError};
pub use session::{EditorHandle, Ended, Session, SessionConfig, SessionError};
