// SPDX-License-Identifier: MIT
//
// vmux — remote display mirroring for an embedded editor.
//
// The facade crate: re-exports the screen core and the session layer so
// embedders depend on one name. The interesting code lives in
// `vmux-screen` (state, diffing, wire format) and `vmux-session`
// (session lifecycle, input handoff).

pub use vmux_screen::args::{RedrawEvent, Value};
pub use vmux_screen::attrs::{AttrId, CellAttrs, StyleFlags};
pub use vmux_screen::color::Color;
pub use vmux_screen::decode::{ClientFrame, Decoder, Mirror, WireOp};
pub use vmux_screen::ops::{Mode, Op};
pub use vmux_screen::screen::Screen;
pub use vmux_session::{
    run_input_pump, EditorHandle, Ended, InputSlot, Session, SessionConfig, SessionError,
};
