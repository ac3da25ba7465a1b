// SPDX-License-Identifier: MIT
//
// Protocol opcodes and mode flags.
//
// Each server→client operation starts with one opcode byte; the payload
// shape behind it is fixed per opcode (see the stream and decode
// modules). Two opcodes also flow client→server: Keyboard (raw UTF-8
// input) and Resize (the fixed-width handshake variant).
//
// Mode is a bitfield the flush opcode ships so clients can draw the
// right cursor without mirroring any editor state: the base mode
// (normal/insert/replace) plus folded-in busy/mouse bits, and a redraw
// bit that suppresses visible cursor movement during a full resync.

// ─── Opcodes ─────────────────────────────────────────────────────────────────

/// Wire opcode. The numeric values are the protocol; changing one breaks
/// every deployed client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Op {
    Resize = 1,
    Clear = 2,
    Keyboard = 3,
    /// Reserved for client-side use; the server never emits it.
    Cursor = 4,
    Palette = 5,
    Style = 6,
    Put = 7,
    PutRep = 8,
    Title = 9,
    Icon = 10,
    Bell = 11,
    Scroll = 12,
    Flush = 13,
    Log = 14,
}

impl Op {
    /// Decode an opcode byte.
    #[must_use]
    pub const fn from_byte(b: u8) -> Option<Self> {
        Some(match b {
            1 => Self::Resize,
            2 => Self::Clear,
            3 => Self::Keyboard,
            4 => Self::Cursor,
            5 => Self::Palette,
            6 => Self::Style,
            7 => Self::Put,
            8 => Self::PutRep,
            9 => Self::Title,
            10 => Self::Icon,
            11 => Self::Bell,
            12 => Self::Scroll,
            13 => Self::Flush,
            14 => Self::Log,
            _ => return None,
        })
    }
}

// ─── Mode flags ──────────────────────────────────────────────────────────────

bitflags::bitflags! {
    /// Editor mode and display state, as shipped by the flush opcode.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
    pub struct Mode: u8 {
        /// The editor is busy; clients typically hide the cursor.
        const BUSY     = 1 << 0;
        /// Mouse reporting is enabled.
        const MOUSE_ON = 1 << 1;
        /// Normal mode (block cursor).
        const NORMAL   = 1 << 2;
        /// Insert mode (bar cursor).
        const INSERT   = 1 << 3;
        /// Replace mode (underline cursor).
        const REPLACE  = 1 << 4;
        /// The flush belongs to a full resync; don't animate the cursor.
        const REDRAW   = 1 << 5;
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
