// SPDX-License-Identifier: MIT
//
// Screen — the authoritative mirror of the editor's display.
//
// One flat row-major grid of cells, a cursor, a scroll region, mode
// flags, and the attribute machinery. The editor drives it with batches
// of named redraw operations (resize, put, scroll, highlight_set, …);
// every mutation lands here first, and the stream module serializes the
// net effect into one payload per batch.
//
// Two pieces of bookkeeping make the encoding cheap:
//
//   - Run tracking: consecutive puts extend a [run_start, run_end)
//     window of untransmitted cells. Anything that breaks contiguity
//     (cursor move, resize, scroll, style change) flushes the window
//     into Put/PutRep opcodes first.
//
//   - Reference counts: the attribute table knows how many cells
//     display with each interned set, so palette invalidation can evict
//     sets nothing references.
//
// Error policy: the editor's arguments are loosely typed and its op
// vocabulary grows over time. Unknown ops and malformed arguments are
// logged and skipped; a zero-area resize is rejected outright. Nothing
// in this module panics on editor input.

use tracing::{debug, trace, warn};
use unicode_width::UnicodeWidthChar;

use crate::args::{ArgReader, RedrawEvent};
use crate::attrs::{AttrId, AttrTable, CellAttrs, StyleFlags};
use crate::cell::Cell;
use crate::codec::StreamBuffer;
use crate::color::Color;
use crate::ops::Mode;

/// Fallback geometry when a session is created with a zero dimension.
pub const DEFAULT_COLS: u16 = 80;
/// See [`DEFAULT_COLS`].
pub const DEFAULT_ROWS: u16 = 20;

// ─── ScrollRegion ────────────────────────────────────────────────────────────

/// The rectangle `scroll` operates on. All edges inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScrollRegion {
    pub top: u16,
    pub bottom: u16,
    pub left: u16,
    pub right: u16,
}

impl ScrollRegion {
    /// The full-screen region for a given geometry.
    #[must_use]
    pub const fn full(width: u16, height: u16) -> Self {
        Self {
            top: 0,
            bottom: height.saturating_sub(1),
            left: 0,
            right: width.saturating_sub(1),
        }
    }
}

// ─── Screen ──────────────────────────────────────────────────────────────────

/// The authoritative in-memory screen state for one editor session.
///
/// Not internally synchronized: the owning session wraps it in a lock
/// and holds that lock across an entire batch plus its flush.
pub struct Screen {
    pub(crate) width: u16,
    pub(crate) height: u16,
    pub(crate) cells: Vec<Cell>,
    pub(crate) cursor_x: u16,
    pub(crate) cursor_y: u16,
    pub(crate) scroll: ScrollRegion,
    pub(crate) mode: Mode,
    pub(crate) busy: bool,
    pub(crate) mouse: bool,
    pub(crate) title: String,
    pub(crate) default_attrs: CellAttrs,
    pub(crate) cur_attrs: CellAttrs,
    pub(crate) cur_id: AttrId,
    pub(crate) attrs: AttrTable,

    // Run tracking for consecutive puts.
    pub(crate) run_start: usize,
    pub(crate) run_end: Option<usize>,

    // Wire state (driven from the stream module).
    pub(crate) payload: StreamBuffer,
    pub(crate) sink: Option<Box<dyn std::io::Write + Send>>,
    pub(crate) sent_attrs: std::collections::HashMap<AttrId, u32>,
    pub(crate) pending_palette: Vec<AttrId>,
    pub(crate) last_style: Option<AttrId>,
    pub(crate) clear_end: usize,
    pub(crate) resyncing: bool,
}

impl Screen {
    // ─── Construction ────────────────────────────────────────────────────

    /// Create a screen at the requested geometry.
    ///
    /// A zero dimension falls back to 80×20 (logged) — a zero-area
    /// buffer breaks the row addressing arithmetic everywhere else.
    #[must_use]
    pub fn new(width: u16, height: u16) -> Self {
        let (width, height) = if width == 0 || height == 0 {
            warn!(width, height, "zero screen dimension, using fallback");
            (DEFAULT_COLS, DEFAULT_ROWS)
        } else {
            (width, height)
        };

        let len = usize::from(width) * usize::from(height);
        let mut attrs = AttrTable::new();
        attrs.reset_refs(AttrId::DEFAULT, len);

        Self {
            width,
            height,
            cells: vec![Cell::BLANK; len],
            cursor_x: 0,
            cursor_y: 0,
            scroll: ScrollRegion::full(width, height),
            mode: Mode::NORMAL,
            busy: false,
            mouse: true,
            title: String::new(),
            default_attrs: CellAttrs::default(),
            cur_attrs: CellAttrs::default(),
            cur_id: AttrId::DEFAULT,
            attrs,
            run_start: 0,
            run_end: None,
            payload: StreamBuffer::new(),
            sink: None,
            sent_attrs: std::collections::HashMap::new(),
            pending_palette: Vec::new(),
            last_style: None,
            clear_end: 0,
            resyncing: false,
        }
    }

    // ─── Accessors ───────────────────────────────────────────────────────

    /// Width in columns.
    #[inline]
    #[must_use]
    pub const fn width(&self) -> u16 {
        self.width
    }

    /// Height in rows.
    #[inline]
    #[must_use]
    pub const fn height(&self) -> u16 {
        self.height
    }

    /// Cursor position as `(x, y)`.
    #[inline]
    #[must_use]
    pub const fn cursor(&self) -> (u16, u16) {
        (self.cursor_x, self.cursor_y)
    }

    /// The window title last set by the editor.
    #[must_use]
    pub fn title(&self) -> &str {
        &self.title
    }

    /// Current base mode (normal/insert/replace bit).
    #[inline]
    #[must_use]
    pub const fn mode(&self) -> Mode {
        self.mode
    }

    /// Whether the editor reported itself busy.
    #[inline]
    #[must_use]
    pub const fn is_busy(&self) -> bool {
        self.busy
    }

    /// Whether mouse reporting is on.
    #[inline]
    #[must_use]
    pub const fn mouse_enabled(&self) -> bool {
        self.mouse
    }

    /// The session default attribute set (identity 0).
    #[inline]
    #[must_use]
    pub const fn default_attrs(&self) -> CellAttrs {
        self.default_attrs
    }

    /// The attribute set new characters are written with.
    #[inline]
    #[must_use]
    pub const fn current_attrs(&self) -> CellAttrs {
        self.cur_attrs
    }

    /// The cell at `(x, y)`, or `None` out of bounds.
    #[must_use]
    pub fn cell(&self, x: u16, y: u16) -> Option<Cell> {
        if x < self.width && y < self.height {
            Some(self.cells[self.index(x, y)])
        } else {
            None
        }
    }

    /// The attribute set a cell displays with, identity resolved.
    #[must_use]
    pub fn cell_attrs(&self, x: u16, y: u16) -> Option<CellAttrs> {
        let cell = self.cell(x, y)?;
        if cell.attr.is_default() {
            Some(self.default_attrs)
        } else {
            self.attrs.get(cell.attr)
        }
    }

    /// One row's characters as a string (test/debug helper).
    #[must_use]
    pub fn row_text(&self, y: u16) -> Option<String> {
        if y >= self.height {
            return None;
        }
        let start = self.index(0, y);
        Some(
            self.cells[start..start + usize::from(self.width)]
                .iter()
                .map(|c| c.ch)
                .collect(),
        )
    }

    #[inline]
    pub(crate) fn index(&self, x: u16, y: u16) -> usize {
        usize::from(y) * usize::from(self.width) + usize::from(x)
    }

    #[inline]
    pub(crate) fn cursor_index(&self) -> usize {
        self.index(self.cursor_x, self.cursor_y)
    }

    // ─── Redraw application ──────────────────────────────────────────────

    /// Apply one batch of redraw events, then flush the resulting
    /// payload to the attached sink (or discard it when detached).
    ///
    /// # Errors
    ///
    /// Returns the sink's write error, if any. The screen state itself
    /// is always updated; the caller is expected to detach on error.
    pub fn apply_redraw(&mut self, updates: &[RedrawEvent]) -> std::io::Result<()> {
        for event in updates {
            for call in &event.calls {
                let mut args = ArgReader::new(call);
                self.apply_op(&event.name, &mut args);
            }
        }
        self.flush()
    }

    /// Dispatch one named operation. Unknown names and malformed
    /// arguments skip the op.
    fn apply_op(&mut self, name: &str, args: &mut ArgReader<'_>) {
        match name {
            "resize" => {
                self.flush_put_ops();
                let (Some(w), Some(h)) = (args.uint(), args.uint()) else {
                    warn!(op = name, "malformed arguments, skipping");
                    return;
                };
                if self.set_size(clamp_dim(w), clamp_dim(h)) {
                    self.write_size();
                }
            }

            "clear" => self.clear_screen(),

            "eol_clear" => self.clear_line(),

            "cursor_goto" => {
                self.flush_put_ops();
                let (Some(y), Some(x)) = (args.uint(), args.uint()) else {
                    warn!(op = name, "malformed arguments, skipping");
                    return;
                };
                self.set_cursor(clamp_dim(x), clamp_dim(y));
            }

            "update_fg" => {
                if let Some(n) = args.int() {
                    self.default_attrs.fg = Color::from_packed(n as u32);
                }
            }
            "update_bg" => {
                if let Some(n) = args.int() {
                    self.default_attrs.bg = Color::from_packed(n as u32);
                }
            }
            "update_sp" => {
                if let Some(n) = args.int() {
                    self.default_attrs.sp = Color::from_packed(n as u32);
                }
            }

            "highlight_set" => {
                self.flush_put_ops();
                let Some(map) = args.map() else {
                    warn!(op = name, "expected a map argument, skipping");
                    return;
                };

                let mut derived = self.default_attrs;
                if let Some(c) = map.int("foreground") {
                    derived.fg = Color::from_packed(c as u32);
                }
                if let Some(c) = map.int("background") {
                    derived.bg = Color::from_packed(c as u32);
                }
                if let Some(c) = map.int("special") {
                    derived.sp = Color::from_packed(c as u32);
                }
                for (key, flag) in [
                    ("reverse", StyleFlags::REVERSE),
                    ("italic", StyleFlags::ITALIC),
                    ("bold", StyleFlags::BOLD),
                    ("underline", StyleFlags::UNDERLINE),
                    ("undercurl", StyleFlags::UNDERCURL),
                ] {
                    if map.bool(key) == Some(true) {
                        derived.flags |= flag;
                    }
                }

                self.cur_attrs = derived;
                self.cur_id = if derived == self.default_attrs {
                    AttrId::DEFAULT
                } else {
                    self.attrs.intern(derived)
                };
                self.write_style(self.cur_id);
            }

            "put" => {
                let text = args.strings();
                self.put_text(&text);
            }

            "set_scroll_region" => {
                let (Some(top), Some(bottom), Some(left), Some(right)) =
                    (args.uint(), args.uint(), args.uint(), args.uint())
                else {
                    warn!(op = name, "malformed arguments, skipping");
                    return;
                };
                let (top, bottom) = (clamp_dim(top), clamp_dim(bottom));
                let (left, right) = (clamp_dim(left), clamp_dim(right));
                if top > bottom || left > right || bottom >= self.height || right >= self.width {
                    warn!(top, bottom, left, right, "invalid scroll region, skipping");
                    return;
                }
                self.scroll = ScrollRegion {
                    top,
                    bottom,
                    left,
                    right,
                };
            }

            "scroll" => {
                self.flush_put_ops();
                let Some(delta) = args.int() else {
                    warn!(op = name, "malformed arguments, skipping");
                    return;
                };
                let delta = delta.clamp(i64::from(i16::MIN), i64::from(i16::MAX)) as i16;
                if delta != 0 {
                    self.do_scroll(delta);
                    self.write_scroll(delta);
                }
            }

            "set_title" => {
                let s = args.strings();
                self.title = s.clone();
                self.write_run_op(crate::ops::Op::Title, &s);
            }

            "set_icon" => {
                let s = args.strings();
                self.write_run_op(crate::ops::Op::Icon, &s);
            }

            "mode_change" => match args.string() {
                Some("normal") => self.mode = Mode::NORMAL,
                Some("insert") => self.mode = Mode::INSERT,
                Some("replace") => self.mode = Mode::REPLACE,
                other => debug!(mode = ?other, "unrecognized mode"),
            },

            "mouse_on" => {
                self.mouse = true;
                debug!("mouse enabled");
            }
            "mouse_off" => {
                self.mouse = false;
                debug!("mouse disabled");
            }

            "busy_on" | "busy_start" => {
                self.busy = true;
                debug!("busy");
            }
            "busy_off" | "busy_stop" => {
                self.busy = false;
                debug!("not busy");
            }

            "bell" => self.write_bell(false),
            "visual_bell" => self.write_bell(true),

            // Recognized but deliberately inert.
            "suspend" | "popupmenu_show" | "popupmenu_select" | "popupmenu_hide" => {
                trace!(op = name, "ignored");
            }

            _ => warn!(op = name, "unknown redraw op"),
        }
    }

    // ─── Cell mutation ───────────────────────────────────────────────────

    /// Write one cell, keeping reference counts and the sent flag
    /// consistent with the change.
    pub(crate) fn put_cell(&mut self, index: usize, ch: char, attr: AttrId) {
        let old = self.cells[index];
        if old.attr != attr {
            self.attrs.release(old.attr);
            self.attrs.retain(attr);
        }
        let cell = &mut self.cells[index];
        if old.ch != ch || old.attr != attr {
            cell.sent = false;
        }
        cell.ch = ch;
        cell.attr = attr;
    }

    /// Write a string at the cursor with the current attributes.
    ///
    /// The cursor advances by each character's display width; a
    /// double-width character owns two cells, the second holding a
    /// space placeholder with the same identity. Row wrap falls out of
    /// the flat index arithmetic.
    fn put_text(&mut self, text: &str) {
        let len = self.cells.len();
        let w = usize::from(self.width);
        let mut index = self.cursor_index();

        // A fresh run anchors at the cursor; only consecutive puts with
        // no flush between them may extend one window.
        if self.run_end.is_none() {
            self.run_start = index;
        }

        for ch in text.chars() {
            let cw = ch.width().unwrap_or(1);
            if cw == 0 {
                // Combining marks don't own a cell.
                continue;
            }
            if index + cw > len {
                trace!(ch = %ch, "put past end of buffer, dropping");
                break;
            }
            self.put_cell(index, ch, self.cur_id);
            index += 1;
            if cw == 2 {
                self.put_cell(index, ' ', self.cur_id);
                index += 1;
            }
            self.run_end = Some(index);
        }

        if index < len {
            self.cursor_x = (index % w) as u16;
            self.cursor_y = (index / w) as u16;
        } else {
            self.cursor_x = self.width - 1;
            self.cursor_y = self.height - 1;
        }
    }

    /// Move the cursor and restart run tracking there.
    fn set_cursor(&mut self, x: u16, y: u16) {
        self.cursor_x = x.min(self.width - 1);
        self.cursor_y = y.min(self.height - 1);
        self.run_start = self.cursor_index();
        self.run_end = None;
    }

    /// Reset the whole grid to spaces with the default identity and
    /// emit the clear opcode (which also invalidates the palette).
    fn clear_screen(&mut self) {
        self.run_start = 0;
        self.run_end = None;
        for cell in &mut self.cells {
            *cell = Cell::BLANK;
        }
        self.attrs.reset_refs(AttrId::DEFAULT, self.cells.len());
        self.cursor_x = 0;
        self.cursor_y = 0;
        self.write_clear();
    }

    /// Clear from the cursor to end of row with the current attributes
    /// and transmit that range immediately.
    fn clear_line(&mut self) {
        self.flush_put_ops();
        let i1 = self.cursor_index();
        let i2 = i1 + usize::from(self.width - self.cursor_x);
        for i in i1..i2 {
            self.put_cell(i, ' ', self.cur_id);
        }
        self.write_range(i1, i2);
    }

    // ─── Resize ──────────────────────────────────────────────────────────

    /// Reallocate the grid, preserving the overlapping region and
    /// clearing everything else. Returns false (state untouched) for a
    /// zero dimension.
    pub(crate) fn set_size(&mut self, width: u16, height: u16) -> bool {
        if width == 0 || height == 0 {
            warn!(width, height, "rejecting zero-area resize");
            return false;
        }

        let new_len = usize::from(width) * usize::from(height);
        let mut cells = vec![Cell::BLANK; new_len];

        let copy_w = usize::from(self.width.min(width));
        let copy_h = usize::from(self.height.min(height));
        for y in 0..copy_h {
            let src = y * usize::from(self.width);
            let dst = y * usize::from(width);
            cells[dst..dst + copy_w].copy_from_slice(&self.cells[src..src + copy_w]);
        }

        self.cells = cells;
        self.width = width;
        self.height = height;

        // Rebuild reference counts from scratch; the old grid is gone.
        self.attrs.reset_refs(AttrId::DEFAULT, 0);
        for i in 0..self.cells.len() {
            let id = self.cells[i].attr;
            self.attrs.retain(id);
        }

        self.cursor_x = self.cursor_x.min(width - 1);
        self.cursor_y = self.cursor_y.min(height - 1);
        self.scroll = ScrollRegion::full(width, height);
        self.run_start = 0;
        self.run_end = None;
        true
    }

    // ─── Scroll ──────────────────────────────────────────────────────────

    /// Shift rows inside the scroll region by `delta` (positive moves
    /// content toward lower indices). Vacated rows fill with spaces in
    /// the current attributes. Copy order always proceeds away from the
    /// vacated edge so no source row is overwritten before it is read.
    fn do_scroll(&mut self, delta: i16) {
        let sr = self.scroll;
        let rows = usize::from(sr.bottom - sr.top + 1);
        let amount = (usize::from(delta.unsigned_abs())).min(rows);
        let top = usize::from(sr.top);
        let bottom = usize::from(sr.bottom);
        let (left, right) = (usize::from(sr.left), usize::from(sr.right));

        if amount >= rows {
            for y in top..=bottom {
                self.blank_row_segment(y, left, right);
            }
            return;
        }

        if delta > 0 {
            for y in top + amount..=bottom {
                self.copy_row_segment(y, y - amount, left, right);
            }
            for y in bottom + 1 - amount..=bottom {
                self.blank_row_segment(y, left, right);
            }
        } else {
            for y in (top..=bottom - amount).rev() {
                self.copy_row_segment(y, y + amount, left, right);
            }
            for y in top..top + amount {
                self.blank_row_segment(y, left, right);
            }
        }
    }

    fn copy_row_segment(&mut self, src_y: usize, dst_y: usize, left: usize, right: usize) {
        let w = usize::from(self.width);
        for x in left..=right {
            let src = self.cells[src_y * w + x];
            let dst_i = dst_y * w + x;
            let old = self.cells[dst_i];
            if old.attr != src.attr {
                self.attrs.release(old.attr);
                self.attrs.retain(src.attr);
            }
            self.cells[dst_i] = src;
        }
    }

    fn blank_row_segment(&mut self, y: usize, left: usize, right: usize) {
        let w = usize::from(self.width);
        for x in left..=right {
            let i = y * w + x;
            let old = self.cells[i];
            if old.attr != self.cur_id {
                self.attrs.release(old.attr);
                self.attrs.retain(self.cur_id);
            }
            // The scroll opcode blanks the same rows client-side, so
            // the cells stay in sync without a retransmit.
            self.cells[i] = Cell {
                ch: ' ',
                attr: self.cur_id,
                sent: true,
            };
        }
    }
}

impl std::fmt::Debug for Screen {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Screen({}x{}, cursor {},{})",
            self.width, self.height, self.cursor_x, self.cursor_y
        )
    }
}

/// Editor geometry arrives as arbitrary integers; anything beyond u16
/// is nonsense and clamps.
fn clamp_dim(n: u32) -> u16 {
    u16::try_from(n).unwrap_or(u16::MAX)
}

// ─── Tests ───────────────────────────────────────────────────────────────────
