// SPDX-License-Identifier: MIT
//
// Stream encoding — turning screen mutations into the smallest payload.
//
// The screen module records what changed; this module decides what to
// say about it. Three ideas carry the whole format:
//
//   - Style stickiness. A style-select opcode is written only when the
//     attribute identity differs from the last one on the stream, so a
//     page of same-styled text costs one style byte total.
//
//   - Repeat compression. Inside a range of same-styled cells, a run of
//     MIN_REPEAT or more identical characters collapses into a single
//     put-repeated opcode; everything else accumulates into literal
//     puts. Blank regions — most of any screen — become three varints.
//
//   - Palette deduplication. An attribute set's full definition crosses
//     the wire once per sink. Each flush prepends one palette opcode
//     covering only the identities this sink has never seen, spliced
//     directly after a clear when one was emitted (the clear resets the
//     client's palette, so new entries must land after it).
//
// Every flush ends with a flush opcode carrying cursor and mode state,
// so a client can paint a cursor without mirroring any screen logic.
//
// Attach is the degenerate case: a new sink knows nothing, so the
// entire buffer is sent as size + clear + style/range groups — never an
// incremental diff against state the sink doesn't have.

use std::io;

use tracing::{debug, warn};
use unicode_width::UnicodeWidthChar;

use crate::attrs::AttrId;
use crate::codec::StreamBuffer;
use crate::color::Color;
use crate::ops::{Mode, Op};
use crate::screen::Screen;

/// Identical-character runs at least this long compress into a single
/// put-repeated opcode; shorter runs stay literal. A run of exactly
/// `MIN_REPEAT` compresses.
pub const MIN_REPEAT: usize = 3;

impl Screen {
    // ─── Sink lifecycle ──────────────────────────────────────────────────

    /// Install a sink and resynchronize it from scratch.
    ///
    /// Any unflushed payload is dropped — it was addressed to a sink
    /// that no longer exists, and this one needs the full picture
    /// anyway: size, clear (which resets the client palette), then one
    /// style+range pair per contiguous group of equal identities.
    ///
    /// # Errors
    ///
    /// Returns the sink's write error from the resync flush.
    pub fn attach(&mut self, sink: Box<dyn io::Write + Send>) -> io::Result<()> {
        self.payload.clear();
        self.clear_end = 0;
        self.run_end = None;
        self.run_start = self.cursor_index();
        self.last_style = None;
        self.sink = Some(sink);
        self.resyncing = true;
        debug!("sink attached, resyncing");

        self.write_size();
        self.write_clear();

        let len = self.cells.len();
        let mut start = 0;
        for i in 1..=len {
            if i == len || self.cells[i].attr != self.cells[start].attr {
                self.write_range(start, i);
                start = i;
            }
        }
        self.flush()
    }

    /// Remove the sink. Later flushes keep the bookkeeping honest but
    /// produce no I/O; a future attach resyncs from scratch.
    pub fn detach(&mut self) {
        if self.sink.take().is_some() {
            debug!("sink detached");
        }
    }

    /// Whether a sink is currently attached.
    #[must_use]
    pub fn has_sink(&self) -> bool {
        self.sink.is_some()
    }

    // ─── Flush ───────────────────────────────────────────────────────────

    /// Serialize everything pending plus cursor/mode state and hand it
    /// to the sink.
    ///
    /// Detached screens complete the same bookkeeping and discard the
    /// bytes. The payload buffer is empty afterwards either way — a
    /// write error does not retry; reattach-and-resync is the recovery
    /// path.
    ///
    /// # Errors
    ///
    /// The sink's write error. The caller is expected to detach.
    pub fn flush(&mut self) -> io::Result<()> {
        self.write_flush();

        let mut data = self.payload.take();
        let clear_end = self.clear_end;
        self.clear_end = 0;
        self.resyncing = false;

        if self.sink.is_none() {
            return Ok(());
        }

        if let Some(palette) = self.take_palette() {
            let mut framed = Vec::with_capacity(data.len() + palette.len());
            framed.extend_from_slice(&data[..clear_end]);
            framed.extend_from_slice(&palette);
            framed.extend_from_slice(&data[clear_end..]);
            data = framed;
        }

        if let Some(sink) = self.sink.as_mut() {
            if let Err(e) = sink.write_all(&data).and_then(|()| sink.flush()) {
                warn!(error = %e, "sink write failed");
                return Err(e);
            }
        }
        Ok(())
    }

    /// Build the palette opcode for identities this sink hasn't seen,
    /// or `None` when there are none. Marks them seen.
    fn take_palette(&mut self) -> Option<Vec<u8>> {
        let pending = std::mem::take(&mut self.pending_palette);
        let mut entries = Vec::new();
        for id in pending {
            let Some(count) = self.sent_attrs.get_mut(&id) else {
                continue;
            };
            if *count != 0 {
                continue;
            }
            *count += 1;
            if let Some(def) = self.attrs.get(id) {
                entries.push((id, def));
            }
        }
        if entries.is_empty() {
            return None;
        }

        // Per-flush color table in first-use order; attributes refer to
        // it by index.
        let mut colors: Vec<Color> = Vec::new();
        let mut body = StreamBuffer::new();
        for (id, def) in &entries {
            body.write_uint(id.raw());
            body.write_byte(def.flags.bits());
            for c in [def.fg, def.bg, def.sp] {
                let idx = match colors.iter().position(|&x| x == c) {
                    Some(i) => i,
                    None => {
                        colors.push(c);
                        colors.len() - 1
                    }
                };
                body.write_uint(idx as u32);
            }
        }

        let mut pal = StreamBuffer::new();
        pal.write_op(Op::Palette);
        pal.write_uint(colors.len() as u32);
        for c in &colors {
            pal.write_color(*c);
        }
        pal.write_uint(entries.len() as u32);
        pal.write_raw(body.as_bytes());
        Some(pal.take())
    }

    // ─── Opcode writers ──────────────────────────────────────────────────

    pub(crate) fn write_size(&mut self) {
        self.payload.write_op(Op::Resize);
        self.payload.write_uint(u32::from(self.width));
        self.payload.write_uint(u32::from(self.height));
    }

    /// Emit the clear opcode and invalidate everything the sink knew.
    ///
    /// The default colors travel inline here — the one place colors are
    /// sent uncompressed — because the client resets its palette on
    /// clear and needs a baseline before any palette arrives.
    pub(crate) fn write_clear(&mut self) {
        self.sent_attrs.clear();
        self.pending_palette.clear();
        self.last_style = None;
        let keep = self.cur_id;
        self.attrs.evict_unused(keep);

        self.payload.write_op(Op::Clear);
        let d = self.default_attrs;
        self.payload.write_uint(AttrId::DEFAULT.raw());
        self.payload.write_byte(d.flags.bits());
        self.payload.write_color(d.fg);
        self.payload.write_color(d.bg);
        self.payload.write_color(d.sp);

        self.clear_end = self.payload.len();
    }

    /// Select a style, skipping the opcode when it is already active.
    /// First sight of a non-default identity queues it for the palette.
    pub(crate) fn write_style(&mut self, id: AttrId) {
        if self.last_style == Some(id) {
            return;
        }
        if !id.is_default() && !self.sent_attrs.contains_key(&id) {
            self.sent_attrs.insert(id, 0);
            self.pending_palette.push(id);
        }
        self.payload.write_op(Op::Style);
        self.payload.write_uint(id.raw());
        self.last_style = Some(id);
    }

    /// Transmit the tracked put window, if it covers anything.
    pub(crate) fn flush_put_ops(&mut self) {
        if let Some(end) = self.run_end.take() {
            if end > self.run_start {
                self.write_range(self.run_start, end);
                self.run_start = end;
            }
        }
    }

    /// Encode the cells in `[i1, i2)` — which must share one attribute
    /// identity — as literal and repeated puts, and mark them sent.
    ///
    /// The scan is greedy: a candidate repeat extends as far as it
    /// holds; reaching `MIN_REPEAT` flushes any pending literal first,
    /// then emits the repeat and resumes after it.
    pub(crate) fn write_range(&mut self, i1: usize, i2: usize) {
        if i2 <= i1 {
            return;
        }
        let attr = self.cells[i1].attr;
        self.write_style(attr);

        let mut lit_start = i1;
        let mut i = i1;
        while i < i2 {
            let ch = self.cells[i].ch;
            let mut j = i + 1;
            while j < i2 && self.cells[j].ch == ch {
                j += 1;
            }
            if j - i >= MIN_REPEAT {
                if i > lit_start {
                    self.write_put(lit_start, i);
                }
                self.write_put_rep(i, j - i, ch);
                lit_start = j;
            }
            i = j;
        }
        if lit_start < i2 {
            self.write_put(lit_start, i2);
        }

        for cell in &mut self.cells[i1..i2] {
            cell.sent = true;
        }
    }

    fn write_put(&mut self, i1: usize, i2: usize) {
        self.payload.write_op(Op::Put);
        self.payload.write_uint(i1 as u32);
        self.payload.write_uint((i2 - i1) as u32);
        for i in i1..i2 {
            let ch = self.cells[i].ch;
            self.payload.write_uint(ch as u32);
        }
    }

    fn write_put_rep(&mut self, offset: usize, count: usize, ch: char) {
        self.payload.write_op(Op::PutRep);
        self.payload.write_uint(offset as u32);
        self.payload.write_uint(count as u32);
        self.payload.write_uint(ch as u32);
    }

    pub(crate) fn write_scroll(&mut self, delta: i16) {
        self.payload.write_op(Op::Scroll);
        self.payload.write_uint(self.default_attrs.bg.packed());
        self.payload.write_i16_be(delta);
        self.payload.write_uint(u32::from(self.scroll.top));
        self.payload.write_uint(u32::from(self.scroll.bottom));
        self.payload.write_uint(u32::from(self.scroll.left));
        self.payload.write_uint(u32::from(self.scroll.right));
    }

    pub(crate) fn write_bell(&mut self, visual: bool) {
        self.payload.write_op(Op::Bell);
        self.payload.write_byte(u8::from(visual));
    }

    /// A rune-run opcode (title, icon, log).
    pub(crate) fn write_run_op(&mut self, op: Op, s: &str) {
        self.payload.write_op(op);
        self.payload.write_str_run(s);
    }

    /// Queue a log line for the client. Reaches the sink on the next
    /// flush.
    pub fn write_log(&mut self, msg: &str) {
        self.write_run_op(Op::Log, msg);
    }

    /// The trailing flush opcode: mode flags (busy/mouse folded in, and
    /// the redraw bit during a resync), cursor position, and the cell
    /// under the cursor with its display width — enough for a client to
    /// overlay a cursor without its own buffer mirror.
    fn write_flush(&mut self) {
        self.flush_put_ops();

        self.payload.write_op(Op::Flush);

        let mut state = self.mode;
        state.set(Mode::BUSY, self.busy);
        state.set(Mode::MOUSE_ON, self.mouse);
        state.set(Mode::REDRAW, self.resyncing);
        self.payload.write_uint(u32::from(state.bits()));
        self.payload.write_uint(u32::from(self.cursor_x));
        self.payload.write_uint(u32::from(self.cursor_y));

        let i = self.cursor_index().min(self.cells.len() - 1);
        let cell = self.cells[i];
        self.payload.write_uint(cell.attr.raw());
        self.payload.write_rune_run(&[cell.ch]);
        self.payload.write_uint(cell.ch.width().unwrap_or(1) as u32);
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
