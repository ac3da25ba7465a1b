// SPDX-License-Identifier: MIT
//
// Session — one editor, one screen, at most one attached sink.
//
// The session owns everything with a lifetime: the screen behind a
// single lock, the handle to the embedded editor, and the ended latch
// that tells every helper thread to wind down. There is deliberately no
// process-global registry — a session is a plain value you pass by
// reference, so several can coexist and tests never share state.
//
// Locking discipline: the screen lock is held for an entire redraw
// batch plus its flush, and attach/detach take the same lock, so an
// observer never sees a half-applied batch and a resync can't
// interleave with one. A sink write error surfaces to the caller of the
// batch; it does not end the session — the connection layer detaches
// and the client reconnects into a full resync.

use std::io;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

use thiserror::Error;
use tracing::warn;

use vmux_screen::args::RedrawEvent;
use vmux_screen::screen::Screen;

/// The embedded editor, reduced to what the session needs from it.
///
/// The process lifecycle and RPC transport behind these calls live
/// outside this crate; implementations forward to whatever speaks to
/// the real editor.
pub trait EditorHandle: Send + Sync {
    /// Feed keyboard input to the editor.
    ///
    /// # Errors
    ///
    /// Whatever the transport reports; the caller abandons the
    /// connection that produced the input.
    fn input(&self, keys: &str) -> io::Result<()>;

    /// Ask the editor to resize its UI. The buffer itself resizes when
    /// the editor answers with a resize redraw op.
    ///
    /// # Errors
    ///
    /// Whatever the transport reports.
    fn resize(&self, cols: u16, rows: u16) -> io::Result<()>;
}

// ─── Config ──────────────────────────────────────────────────────────────────

/// Session tunables, all with serviceable defaults.
#[derive(Debug, Clone, Copy)]
pub struct SessionConfig {
    /// Initial screen geometry, until the editor's first resize.
    pub cols: u16,
    /// See `cols`.
    pub rows: u16,
    /// How long a connection read loop may wait to hand a frame to the
    /// input pump before abandoning the connection.
    pub input_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            cols: 80,
            rows: 20,
            input_timeout: Duration::from_secs(1),
        }
    }
}

// ─── Errors ──────────────────────────────────────────────────────────────────

/// What can go wrong at the session boundary.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The attached sink failed to accept a payload. Detach and let the
    /// client reconnect; the data is not replayed.
    #[error("sink write failed: {0}")]
    Io(#[from] io::Error),

    /// The editor transport rejected a forwarded call.
    #[error("editor {what} failed: {source}")]
    Editor {
        what: &'static str,
        source: io::Error,
    },

    /// The session has ended; nothing can be applied or forwarded.
    #[error("session has ended")]
    Ended,
}

// ─── Ended latch ─────────────────────────────────────────────────────────────

/// A one-shot latch: once set it stays set, and setting it wakes every
/// waiter. Clones observe the same latch.
#[derive(Clone, Default)]
pub struct Ended {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl Ended {
    /// A fresh, unset latch.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, bool> {
        self.inner
            .0
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Set the latch. Idempotent.
    pub fn end(&self) {
        *self.lock() = true;
        self.inner.1.notify_all();
    }

    /// Whether the latch is set.
    #[must_use]
    pub fn is_ended(&self) -> bool {
        *self.lock()
    }

    /// Block until the latch is set.
    pub fn wait(&self) {
        let mut ended = self.lock();
        while !*ended {
            ended = self
                .inner
                .1
                .wait(ended)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
        }
    }

    /// Block until the latch is set or `timeout` passes. Returns
    /// whether it is set.
    #[must_use]
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut ended = self.lock();
        if *ended {
            return true;
        }
        let (guard, _) = self
            .inner
            .1
            .wait_timeout(ended, timeout)
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        ended = guard;
        *ended
    }
}

impl std::fmt::Debug for Ended {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Ended({})", self.is_ended())
    }
}

// ─── Session ─────────────────────────────────────────────────────────────────

/// One mirrored editor session.
pub struct Session {
    screen: Mutex<Screen>,
    editor: Arc<dyn EditorHandle>,
    ended: Ended,
    input_timeout: Duration,
}

impl Session {
    /// Create a session around an editor handle.
    #[must_use]
    pub fn new(editor: Arc<dyn EditorHandle>, config: &SessionConfig) -> Self {
        Self {
            screen: Mutex::new(Screen::new(config.cols, config.rows)),
            editor,
            ended: Ended::new(),
            input_timeout: config.input_timeout,
        }
    }

    fn screen_lock(&self) -> MutexGuard<'_, Screen> {
        self.screen.lock().unwrap_or_else(|poisoned| {
            // A panic under the lock means a bug upstream, but the
            // screen data itself stays usable; log and carry on.
            warn!("screen lock poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Apply one redraw batch and flush the result to the sink.
    ///
    /// The screen lock is held for the whole call: batches are atomic
    /// to every observer.
    ///
    /// # Errors
    ///
    /// [`SessionError::Ended`] after [`end`](Self::end);
    /// [`SessionError::Io`] when the sink write fails (the state is
    /// still applied — detach and resync on reconnect).
    pub fn apply_redraw(&self, updates: &[RedrawEvent]) -> Result<(), SessionError> {
        if self.ended.is_ended() {
            return Err(SessionError::Ended);
        }
        let mut screen = self.screen_lock();
        screen.apply_redraw(updates)?;
        Ok(())
    }

    /// Attach a sink and resync it with the full screen contents.
    ///
    /// # Errors
    ///
    /// [`SessionError::Io`] if the resync payload fails to write; the
    /// sink stays attached and the caller decides whether to detach.
    pub fn attach(&self, sink: Box<dyn io::Write + Send>) -> Result<(), SessionError> {
        if self.ended.is_ended() {
            return Err(SessionError::Ended);
        }
        let mut screen = self.screen_lock();
        screen.attach(sink)?;
        Ok(())
    }

    /// Drop the sink. Redraw batches keep applying; bytes go nowhere
    /// until the next attach resyncs.
    pub fn detach(&self) {
        self.screen_lock().detach();
    }

    /// Forward keyboard input to the editor.
    ///
    /// # Errors
    ///
    /// [`SessionError::Ended`] or [`SessionError::Editor`].
    pub fn input(&self, keys: &str) -> Result<(), SessionError> {
        if self.ended.is_ended() {
            return Err(SessionError::Ended);
        }
        self.editor
            .input(keys)
            .map_err(|source| SessionError::Editor {
                what: "input",
                source,
            })
    }

    /// Forward a resize request to the editor. The screen buffer
    /// resizes when the editor's resize redraw op comes back.
    ///
    /// # Errors
    ///
    /// [`SessionError::Ended`] or [`SessionError::Editor`].
    pub fn resize(&self, cols: u16, rows: u16) -> Result<(), SessionError> {
        if self.ended.is_ended() {
            return Err(SessionError::Ended);
        }
        self.editor
            .resize(cols, rows)
            .map_err(|source| SessionError::Editor {
                what: "resize",
                source,
            })
    }

    /// Send a log line to the attached client.
    ///
    /// # Errors
    ///
    /// [`SessionError::Io`] when the flush fails.
    pub fn log_message(&self, msg: &str) -> Result<(), SessionError> {
        let mut screen = self.screen_lock();
        screen.write_log(msg);
        screen.flush()?;
        Ok(())
    }

    /// Run a closure against the screen under the session lock.
    pub fn with_screen<R>(&self, f: impl FnOnce(&Screen) -> R) -> R {
        f(&self.screen_lock())
    }

    /// Mark the session ended, waking everything blocked on the latch.
    pub fn end(&self) {
        self.ended.end();
    }

    /// Whether the session has ended.
    #[must_use]
    pub fn is_ended(&self) -> bool {
        self.ended.is_ended()
    }

    /// A clone of the ended latch, for threads that outlive a borrow.
    #[must_use]
    pub fn ended(&self) -> Ended {
        self.ended.clone()
    }

    /// The configured input handoff timeout, for connection read loops.
    #[must_use]
    pub const fn input_timeout(&self) -> Duration {
        self.input_timeout
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Session(ended: {})", self.is_ended())
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::{run_input_pump, InputSlot};
    use pretty_assertions::assert_eq;
    use std::sync::Mutex as StdMutex;
    use std::thread;
    use vmux_screen::args::Value;
    use vmux_screen::ops::Op;

    /// Records forwarded calls; optionally fails them.
    #[derive(Default)]
    struct FakeEditor {
        inputs: StdMutex<Vec<String>>,
        resizes: StdMutex<Vec<(u16, u16)>>,
        fail: bool,
    }

    impl EditorHandle for FakeEditor {
        fn input(&self, keys: &str) -> io::Result<()> {
            if self.fail {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "editor gone"));
            }
            self.inputs.lock().unwrap().push(keys.to_owned());
            Ok(())
        }

        fn resize(&self, cols: u16, rows: u16) -> io::Result<()> {
            if self.fail {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "editor gone"));
            }
            self.resizes.lock().unwrap().push((cols, rows));
            Ok(())
        }
    }

    fn session_with(editor: Arc<FakeEditor>) -> Session {
        Session::new(editor, &SessionConfig::default())
    }

    fn keyboard_frame(keys: &str) -> Vec<u8> {
        let mut f = vec![Op::Keyboard as u8];
        f.extend_from_slice(keys.as_bytes());
        f
    }

    fn resize_frame(cols: u16, rows: u16) -> Vec<u8> {
        let mut f = vec![Op::Resize as u8];
        f.extend_from_slice(&cols.to_be_bytes());
        f.extend_from_slice(&rows.to_be_bytes());
        f
    }

    // ── Basic forwarding ────────────────────────────────────────────────

    #[test]
    fn input_reaches_the_editor() {
        let editor = Arc::new(FakeEditor::default());
        let session = session_with(Arc::clone(&editor));
        session.input("ihello").unwrap();
        assert_eq!(*editor.inputs.lock().unwrap(), vec!["ihello".to_owned()]);
    }

    #[test]
    fn resize_reaches_the_editor_not_the_screen() {
        let editor = Arc::new(FakeEditor::default());
        let session = session_with(Arc::clone(&editor));
        session.resize(120, 40).unwrap();
        assert_eq!(*editor.resizes.lock().unwrap(), vec![(120, 40)]);
        // The buffer only resizes when the editor echoes a redraw op.
        session.with_screen(|s| assert_eq!((s.width(), s.height()), (80, 20)));
    }

    #[test]
    fn editor_failure_maps_to_editor_error() {
        let editor = Arc::new(FakeEditor {
            fail: true,
            ..FakeEditor::default()
        });
        let session = session_with(editor);
        assert!(matches!(
            session.input("x"),
            Err(SessionError::Editor { what: "input", .. })
        ));
    }

    #[test]
    fn redraw_batch_mutates_the_screen() {
        let session = session_with(Arc::new(FakeEditor::default()));
        session
            .apply_redraw(&[RedrawEvent::single("put", vec![Value::from("ok")])])
            .unwrap();
        session.with_screen(|s| assert_eq!(&s.row_text(0).unwrap()[..2], "ok"));
    }

    // ── Ended latch ─────────────────────────────────────────────────────

    #[test]
    fn ended_session_rejects_everything() {
        let session = session_with(Arc::new(FakeEditor::default()));
        session.end();
        assert!(matches!(
            session.apply_redraw(&[]),
            Err(SessionError::Ended)
        ));
        assert!(matches!(session.input("x"), Err(SessionError::Ended)));
        assert!(matches!(session.resize(1, 1), Err(SessionError::Ended)));
    }

    #[test]
    fn end_wakes_waiters() {
        let session = Arc::new(session_with(Arc::new(FakeEditor::default())));
        let latch = session.ended();
        let waiter = thread::spawn(move || latch.wait());
        thread::sleep(Duration::from_millis(20));
        session.end();
        waiter.join().unwrap();
        assert!(session.is_ended());
    }

    #[test]
    fn wait_timeout_reports_latch_state() {
        let latch = Ended::new();
        assert!(!latch.wait_timeout(Duration::from_millis(10)));
        latch.end();
        assert!(latch.wait_timeout(Duration::from_millis(10)));
    }

    // ── Input pump integration ──────────────────────────────────────────

    #[test]
    fn pump_forwards_keyboard_and_resize_frames() {
        let editor = Arc::new(FakeEditor::default());
        let session = Arc::new(session_with(Arc::clone(&editor)));
        let slot = InputSlot::new();

        let pump = {
            let slot = slot.clone();
            let session = Arc::clone(&session);
            thread::spawn(move || run_input_pump(&slot, &session))
        };

        let timeout = session.input_timeout();
        slot.send_timeout(keyboard_frame(":wq"), timeout).unwrap();
        slot.send_timeout(resize_frame(100, 30), timeout).unwrap();
        slot.send_timeout(vec![0xff, 0x00], timeout).unwrap(); // dropped
        slot.send_timeout(keyboard_frame("gg"), timeout).unwrap();

        // Give the pump time to drain, then shut it down.
        thread::sleep(Duration::from_millis(50));
        slot.close();
        pump.join().unwrap();

        assert_eq!(
            *editor.inputs.lock().unwrap(),
            vec![":wq".to_owned(), "gg".to_owned()]
        );
        assert_eq!(*editor.resizes.lock().unwrap(), vec![(100, 30)]);
    }

    #[test]
    fn pump_abandons_connection_when_editor_fails() {
        let editor = Arc::new(FakeEditor {
            fail: true,
            ..FakeEditor::default()
        });
        let session = Arc::new(session_with(editor));
        let slot = InputSlot::new();

        let pump = {
            let slot = slot.clone();
            let session = Arc::clone(&session);
            thread::spawn(move || run_input_pump(&slot, &session))
        };

        slot.send_timeout(keyboard_frame("x"), Duration::from_secs(1))
            .unwrap();
        pump.join().unwrap();
        assert!(slot.is_closed());
    }

    #[test]
    fn pump_exits_when_session_ends() {
        let session = Arc::new(session_with(Arc::new(FakeEditor::default())));
        let slot: InputSlot<Vec<u8>> = InputSlot::new();

        let pump = {
            let slot = slot.clone();
            let session = Arc::clone(&session);
            thread::spawn(move || run_input_pump(&slot, &session))
        };

        session.end();
        pump.join().unwrap();
        assert!(slot.is_closed());
    }
}
