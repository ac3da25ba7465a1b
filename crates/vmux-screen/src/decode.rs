// SPDX-License-Identifier: MIT
//
// Reference decoder — the client side of the wire protocol.
//
// Three pieces:
//
//   Decoder — parses a server→client payload back into typed WireOps.
//   Mirror  — a minimal client: a grid plus a palette that replays a
//             decoded op stream. Integration tests replay real payloads
//             into a Mirror and compare it against the live screen; a
//             GUI front end does the same thing with pixels.
//   parse_client_frame — the two client→server frames (raw keyboard
//             bytes, and the fixed-width resize handshake).
//
// The decoder is strict about structure (truncation and unknown opcode
// bytes are typed errors) but the Mirror is forgiving about content:
// out-of-range offsets and unknown palette ids degrade to no-ops, the
// same stance the screen takes toward editor input.

use std::collections::HashMap;
use std::fmt;

use crate::attrs::{CellAttrs, StyleFlags};
use crate::codec::ByteReader;
use crate::color::Color;
use crate::ops::{Mode, Op};

// ─── Errors ──────────────────────────────────────────────────────────────────

/// Why a payload failed to decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    /// The payload ended inside an opcode's fields.
    UnexpectedEof,
    /// A leading byte that is no opcode.
    UnknownOp(u8),
    /// A known opcode that never appears server→client.
    WrongDirection(Op),
    /// Structurally valid bytes with impossible content.
    Malformed(&'static str),
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnexpectedEof => write!(f, "payload truncated mid-opcode"),
            Self::UnknownOp(b) => write!(f, "unknown opcode byte {b:#04x}"),
            Self::WrongDirection(op) => write!(f, "client-direction opcode {op:?} in server stream"),
            Self::Malformed(what) => write!(f, "malformed field: {what}"),
        }
    }
}

impl std::error::Error for DecodeError {}

// ─── WireOp ──────────────────────────────────────────────────────────────────

/// One palette entry: an attribute id with indices into the palette
/// opcode's color list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PaletteEntry {
    pub id: u32,
    pub flags: StyleFlags,
    pub fg: u32,
    pub bg: u32,
    pub sp: u32,
}

/// A decoded server→client operation.
#[derive(Debug, Clone, PartialEq)]
pub enum WireOp {
    Resize {
        width: u32,
        height: u32,
    },
    Clear {
        attr: u32,
        flags: StyleFlags,
        fg: Color,
        bg: Color,
        sp: Color,
    },
    Palette {
        colors: Vec<Color>,
        attrs: Vec<PaletteEntry>,
    },
    Style {
        attr: u32,
    },
    Put {
        offset: u32,
        text: String,
    },
    PutRep {
        offset: u32,
        count: u32,
        ch: char,
    },
    Title(String),
    Icon(String),
    Log(String),
    Bell {
        visual: bool,
    },
    Scroll {
        bg: Color,
        delta: i16,
        top: u32,
        bottom: u32,
        left: u32,
        right: u32,
    },
    Flush {
        mode: Mode,
        x: u32,
        y: u32,
        attr: u32,
        ch: char,
        width: u32,
    },
}

// ─── Decoder ─────────────────────────────────────────────────────────────────

/// A cursor-based payload parser.
pub struct Decoder<'a> {
    r: ByteReader<'a>,
}

impl<'a> Decoder<'a> {
    /// Start decoding a payload.
    #[must_use]
    pub const fn new(bytes: &'a [u8]) -> Self {
        Self {
            r: ByteReader::new(bytes),
        }
    }

    /// Decode an entire payload into a vector of operations.
    ///
    /// # Errors
    ///
    /// Any structural problem aborts the whole decode.
    pub fn decode_all(bytes: &'a [u8]) -> Result<Vec<WireOp>, DecodeError> {
        let mut d = Self::new(bytes);
        let mut ops = Vec::new();
        while let Some(op) = d.next_op()? {
            ops.push(op);
        }
        Ok(ops)
    }

    fn uint(&mut self) -> Result<u32, DecodeError> {
        self.r.uint().ok_or(DecodeError::UnexpectedEof)
    }

    fn byte(&mut self) -> Result<u8, DecodeError> {
        self.r.byte().ok_or(DecodeError::UnexpectedEof)
    }

    fn color(&mut self) -> Result<Color, DecodeError> {
        self.r.color().ok_or(DecodeError::UnexpectedEof)
    }

    fn rune_run(&mut self) -> Result<String, DecodeError> {
        self.r.rune_run().ok_or(DecodeError::UnexpectedEof)
    }

    fn one_char(&mut self) -> Result<char, DecodeError> {
        let run = self.rune_run()?;
        let mut chars = run.chars();
        let ch = chars
            .next()
            .ok_or(DecodeError::Malformed("empty cursor rune run"))?;
        if chars.next().is_some() {
            return Err(DecodeError::Malformed("cursor rune run longer than one"));
        }
        Ok(ch)
    }

    /// Decode the next operation, or `None` at a clean end of payload.
    ///
    /// # Errors
    ///
    /// See [`DecodeError`].
    pub fn next_op(&mut self) -> Result<Option<WireOp>, DecodeError> {
        if self.r.is_empty() {
            return Ok(None);
        }
        let b = self.byte()?;
        let op = Op::from_byte(b).ok_or(DecodeError::UnknownOp(b))?;

        let decoded = match op {
            Op::Resize => WireOp::Resize {
                width: self.uint()?,
                height: self.uint()?,
            },

            Op::Clear => WireOp::Clear {
                attr: self.uint()?,
                flags: StyleFlags::from_bits_truncate(self.byte()?),
                fg: self.color()?,
                bg: self.color()?,
                sp: self.color()?,
            },

            Op::Palette => {
                let ncolors = self.uint()?;
                let mut colors = Vec::with_capacity(ncolors as usize);
                for _ in 0..ncolors {
                    colors.push(self.color()?);
                }
                let nattrs = self.uint()?;
                let mut attrs = Vec::with_capacity(nattrs as usize);
                for _ in 0..nattrs {
                    attrs.push(PaletteEntry {
                        id: self.uint()?,
                        flags: StyleFlags::from_bits_truncate(self.byte()?),
                        fg: self.uint()?,
                        bg: self.uint()?,
                        sp: self.uint()?,
                    });
                }
                WireOp::Palette { colors, attrs }
            }

            Op::Style => WireOp::Style { attr: self.uint()? },

            Op::Put => {
                let offset = self.uint()?;
                let text = self.rune_run()?;
                WireOp::Put { offset, text }
            }

            Op::PutRep => {
                let offset = self.uint()?;
                let count = self.uint()?;
                let cp = self.uint()?;
                let ch = char::from_u32(cp).ok_or(DecodeError::Malformed("repeat code point"))?;
                WireOp::PutRep { offset, count, ch }
            }

            Op::Title => WireOp::Title(self.rune_run()?),
            Op::Icon => WireOp::Icon(self.rune_run()?),
            Op::Log => WireOp::Log(self.rune_run()?),

            Op::Bell => WireOp::Bell {
                visual: self.byte()? != 0,
            },

            Op::Scroll => WireOp::Scroll {
                bg: Color::from_packed(self.uint()?),
                delta: self.r.i16_be().ok_or(DecodeError::UnexpectedEof)?,
                top: self.uint()?,
                bottom: self.uint()?,
                left: self.uint()?,
                right: self.uint()?,
            },

            Op::Flush => WireOp::Flush {
                mode: Mode::from_bits_truncate(
                    u8::try_from(self.uint()?)
                        .map_err(|_| DecodeError::Malformed("mode flags"))?,
                ),
                x: self.uint()?,
                y: self.uint()?,
                attr: self.uint()?,
                ch: self.one_char()?,
                width: self.uint()?,
            },

            Op::Keyboard | Op::Cursor => return Err(DecodeError::WrongDirection(op)),
        };

        Ok(Some(decoded))
    }
}

// ─── Mirror ──────────────────────────────────────────────────────────────────

/// One mirrored cell: the character plus the attribute id it was styled
/// with when written (0 = default).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MirrorCell {
    pub ch: char,
    pub attr: u32,
}

impl MirrorCell {
    const BLANK: Self = Self { ch: ' ', attr: 0 };
}

/// A minimal client: grid + palette, driven purely by decoded ops.
///
/// Exists so tests (and any headless consumer) can prove a payload
/// stream reconstructs the server's screen without a GUI in the loop.
#[derive(Debug, Default)]
pub struct Mirror {
    width: u32,
    height: u32,
    cells: Vec<MirrorCell>,
    palette: HashMap<u32, CellAttrs>,
    default_attrs: CellAttrs,
    style: u32,
    cursor: (u32, u32),
    mode: Mode,
    title: String,
    icon: String,
    logs: Vec<String>,
    bells: usize,
}

impl Mirror {
    /// An empty 0×0 mirror; the first resize op gives it a shape.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode `bytes` and apply every op.
    ///
    /// # Errors
    ///
    /// Structural decode errors abort the replay.
    pub fn replay(&mut self, bytes: &[u8]) -> Result<(), DecodeError> {
        for op in Decoder::decode_all(bytes)? {
            self.apply(&op);
        }
        Ok(())
    }

    /// Grid width in columns.
    #[must_use]
    pub const fn width(&self) -> u32 {
        self.width
    }

    /// Grid height in rows.
    #[must_use]
    pub const fn height(&self) -> u32 {
        self.height
    }

    /// The cell at `(x, y)`.
    #[must_use]
    pub fn cell(&self, x: u32, y: u32) -> Option<MirrorCell> {
        if x < self.width && y < self.height {
            Some(self.cells[(y * self.width + x) as usize])
        } else {
            None
        }
    }

    /// The resolved attribute set a cell displays with.
    #[must_use]
    pub fn cell_attrs(&self, x: u32, y: u32) -> Option<CellAttrs> {
        let cell = self.cell(x, y)?;
        if cell.attr == 0 {
            Some(self.default_attrs)
        } else {
            self.palette.get(&cell.attr).copied()
        }
    }

    /// One row's characters.
    #[must_use]
    pub fn row_text(&self, y: u32) -> Option<String> {
        if y >= self.height {
            return None;
        }
        let start = (y * self.width) as usize;
        Some(
            self.cells[start..start + self.width as usize]
                .iter()
                .map(|c| c.ch)
                .collect(),
        )
    }

    /// Cursor position from the last flush.
    #[must_use]
    pub const fn cursor(&self) -> (u32, u32) {
        self.cursor
    }

    /// Mode flags from the last flush.
    #[must_use]
    pub const fn mode(&self) -> Mode {
        self.mode
    }

    /// The last title op.
    #[must_use]
    pub fn title(&self) -> &str {
        &self.title
    }

    /// The last icon op.
    #[must_use]
    pub fn icon(&self) -> &str {
        &self.icon
    }

    /// Every log line received.
    #[must_use]
    pub fn logs(&self) -> &[String] {
        &self.logs
    }

    /// How many bell ops arrived.
    #[must_use]
    pub const fn bells(&self) -> usize {
        self.bells
    }

    /// Apply one decoded op.
    pub fn apply(&mut self, op: &WireOp) {
        match op {
            WireOp::Resize { width, height } => self.resize(*width, *height),

            WireOp::Clear {
                flags,
                fg,
                bg,
                sp,
                ..
            } => {
                self.default_attrs = CellAttrs::new(*flags, *fg, *bg, *sp);
                self.cells.fill(MirrorCell::BLANK);
                self.palette.clear();
                self.style = 0;
                self.cursor = (0, 0);
            }

            WireOp::Palette { colors, attrs } => {
                for e in attrs {
                    let (Some(fg), Some(bg), Some(sp)) = (
                        colors.get(e.fg as usize),
                        colors.get(e.bg as usize),
                        colors.get(e.sp as usize),
                    ) else {
                        continue;
                    };
                    self.palette
                        .insert(e.id, CellAttrs::new(e.flags, *fg, *bg, *sp));
                }
            }

            WireOp::Style { attr } => self.style = *attr,

            WireOp::Put { offset, text } => {
                for (k, ch) in text.chars().enumerate() {
                    self.set(*offset as usize + k, ch);
                }
            }

            WireOp::PutRep { offset, count, ch } => {
                for k in 0..*count as usize {
                    self.set(*offset as usize + k, *ch);
                }
            }

            WireOp::Scroll {
                delta,
                top,
                bottom,
                left,
                right,
                ..
            } => self.scroll(*delta, *top, *bottom, *left, *right),

            WireOp::Flush { mode, x, y, .. } => {
                self.mode = *mode;
                self.cursor = (*x, *y);
            }

            WireOp::Title(s) => self.title.clone_from(s),
            WireOp::Icon(s) => self.icon.clone_from(s),
            WireOp::Log(s) => self.logs.push(s.clone()),
            WireOp::Bell { .. } => self.bells += 1,
        }
    }

    fn set(&mut self, index: usize, ch: char) {
        if let Some(cell) = self.cells.get_mut(index) {
            *cell = MirrorCell {
                ch,
                attr: self.style,
            };
        }
    }

    fn resize(&mut self, width: u32, height: u32) {
        if width == self.width && height == self.height {
            return;
        }
        let mut cells = vec![MirrorCell::BLANK; (width * height) as usize];
        let copy_w = self.width.min(width) as usize;
        for y in 0..self.height.min(height) as usize {
            let src = y * self.width as usize;
            let dst = y * width as usize;
            cells[dst..dst + copy_w].copy_from_slice(&self.cells[src..src + copy_w]);
        }
        self.cells = cells;
        self.width = width;
        self.height = height;
    }

    fn scroll(&mut self, delta: i16, top: u32, bottom: u32, left: u32, right: u32) {
        if bottom >= self.height || right >= self.width || top > bottom || left > right {
            return;
        }
        let rows = (bottom - top + 1) as usize;
        let amount = (usize::from(delta.unsigned_abs())).min(rows);
        let (top, bottom) = (top as usize, bottom as usize);
        let (left, right) = (left as usize, right as usize);
        let w = self.width as usize;

        let copy_row = |cells: &mut Vec<MirrorCell>, src_y: usize, dst_y: usize| {
            for x in left..=right {
                cells[dst_y * w + x] = cells[src_y * w + x];
            }
        };
        let blank_row = |cells: &mut Vec<MirrorCell>, y: usize| {
            for x in left..=right {
                cells[y * w + x] = MirrorCell::BLANK;
            }
        };

        if amount >= rows {
            for y in top..=bottom {
                blank_row(&mut self.cells, y);
            }
            return;
        }

        if delta > 0 {
            for y in top + amount..=bottom {
                copy_row(&mut self.cells, y, y - amount);
            }
            for y in bottom + 1 - amount..=bottom {
                blank_row(&mut self.cells, y);
            }
        } else {
            for y in (top..=bottom - amount).rev() {
                copy_row(&mut self.cells, y, y + amount);
            }
            for y in top..top + amount {
                blank_row(&mut self.cells, y);
            }
        }
    }
}

// ─── Client→server frames ────────────────────────────────────────────────────

/// A decoded client→server frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientFrame {
    /// Raw keyboard input, forwarded to the editor verbatim.
    Keyboard(String),
    /// The fixed-width resize handshake (u16 big-endian pair).
    Resize { cols: u16, rows: u16 },
}

/// Parse one client frame. Malformed or unexpected frames read as
/// `None` and the caller drops them.
#[must_use]
pub fn parse_client_frame(bytes: &[u8]) -> Option<ClientFrame> {
    let (&lead, rest) = bytes.split_first()?;
    match Op::from_byte(lead)? {
        Op::Keyboard => Some(ClientFrame::Keyboard(
            String::from_utf8_lossy(rest).into_owned(),
        )),
        Op::Resize => {
            let mut r = ByteReader::new(rest);
            let cols = r.u16_be()?;
            let rows = r.u16_be()?;
            Some(ClientFrame::Resize { cols, rows })
        }
        _ => None,
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::StreamBuffer;
    use pretty_assertions::assert_eq;

    // ── Decoder round trips ─────────────────────────────────────────────

    #[test]
    fn resize_round_trip() {
        let mut b = StreamBuffer::new();
        b.write_op(Op::Resize);
        b.write_uint(120);
        b.write_uint(40);
        assert_eq!(
            Decoder::decode_all(b.as_bytes()).unwrap(),
            vec![WireOp::Resize {
                width: 120,
                height: 40
            }]
        );
    }

    #[test]
    fn clear_carries_inline_default_colors() {
        let mut b = StreamBuffer::new();
        b.write_op(Op::Clear);
        b.write_uint(0);
        b.write_byte(StyleFlags::BOLD.bits());
        b.write_color(Color::rgb(1, 2, 3));
        b.write_color(Color::rgb(4, 5, 6));
        b.write_color(Color::rgb(7, 8, 9));
        let ops = Decoder::decode_all(b.as_bytes()).unwrap();
        assert_eq!(
            ops,
            vec![WireOp::Clear {
                attr: 0,
                flags: StyleFlags::BOLD,
                fg: Color::rgb(1, 2, 3),
                bg: Color::rgb(4, 5, 6),
                sp: Color::rgb(7, 8, 9),
            }]
        );
    }

    #[test]
    fn scroll_round_trip_negative_delta() {
        let mut b = StreamBuffer::new();
        b.write_op(Op::Scroll);
        b.write_uint(Color::rgb(9, 9, 9).packed());
        b.write_i16_be(-3);
        b.write_uint(1);
        b.write_uint(8);
        b.write_uint(0);
        b.write_uint(79);
        let ops = Decoder::decode_all(b.as_bytes()).unwrap();
        assert_eq!(
            ops,
            vec![WireOp::Scroll {
                bg: Color::rgb(9, 9, 9),
                delta: -3,
                top: 1,
                bottom: 8,
                left: 0,
                right: 79,
            }]
        );
    }

    #[test]
    fn truncated_payload_errors() {
        let mut b = StreamBuffer::new();
        b.write_op(Op::Resize);
        b.write_uint(80);
        // height missing
        assert_eq!(
            Decoder::decode_all(b.as_bytes()),
            Err(DecodeError::UnexpectedEof)
        );
    }

    #[test]
    fn unknown_opcode_errors() {
        assert_eq!(
            Decoder::decode_all(&[0xee]),
            Err(DecodeError::UnknownOp(0xee))
        );
    }

    #[test]
    fn keyboard_in_server_stream_is_wrong_direction() {
        assert_eq!(
            Decoder::decode_all(&[Op::Keyboard as u8]),
            Err(DecodeError::WrongDirection(Op::Keyboard))
        );
    }

    // ── Mirror ──────────────────────────────────────────────────────────

    fn sized_mirror(w: u32, h: u32) -> Mirror {
        let mut m = Mirror::new();
        m.apply(&WireOp::Resize {
            width: w,
            height: h,
        });
        m
    }

    #[test]
    fn put_and_putrep_fill_cells() {
        let mut m = sized_mirror(8, 2);
        m.apply(&WireOp::Style { attr: 2 });
        m.apply(&WireOp::Put {
            offset: 1,
            text: "ab".into(),
        });
        m.apply(&WireOp::PutRep {
            offset: 8,
            count: 3,
            ch: 'z',
        });
        assert_eq!(m.row_text(0).unwrap(), " ab     ");
        assert_eq!(m.row_text(1).unwrap(), "zzz     ");
        assert_eq!(m.cell(1, 0).unwrap().attr, 2);
    }

    #[test]
    fn out_of_range_put_is_dropped() {
        let mut m = sized_mirror(4, 1);
        m.apply(&WireOp::Put {
            offset: 3,
            text: "xy".into(),
        });
        assert_eq!(m.row_text(0).unwrap(), "   x");
    }

    #[test]
    fn clear_resets_grid_and_palette() {
        let mut m = sized_mirror(4, 1);
        m.apply(&WireOp::Palette {
            colors: vec![Color::BLACK],
            attrs: vec![PaletteEntry {
                id: 1,
                flags: StyleFlags::empty(),
                fg: 0,
                bg: 0,
                sp: 0,
            }],
        });
        m.apply(&WireOp::Style { attr: 1 });
        m.apply(&WireOp::Put {
            offset: 0,
            text: "hey!".into(),
        });
        m.apply(&WireOp::Clear {
            attr: 0,
            flags: StyleFlags::empty(),
            fg: Color::WHITE,
            bg: Color::BLACK,
            sp: Color::BLACK,
        });
        assert_eq!(m.row_text(0).unwrap(), "    ");
        assert_eq!(m.cell_attrs(0, 0).unwrap().fg, Color::WHITE);
        // Palette forgotten: styling with id 1 resolves to nothing now.
        m.apply(&WireOp::Style { attr: 1 });
        m.apply(&WireOp::Put {
            offset: 0,
            text: "x".into(),
        });
        assert_eq!(m.cell_attrs(0, 0), None);
    }

    #[test]
    fn mirror_scroll_matches_direction_convention() {
        let mut m = sized_mirror(2, 4);
        for (i, ch) in ['a', 'b', 'c', 'd'].iter().enumerate() {
            m.apply(&WireOp::Put {
                offset: (i * 2) as u32,
                text: ch.to_string(),
            });
        }
        m.apply(&WireOp::Scroll {
            bg: Color::BLACK,
            delta: 1,
            top: 0,
            bottom: 3,
            left: 0,
            right: 1,
        });
        assert_eq!(m.row_text(0).unwrap(), "b ");
        assert_eq!(m.row_text(2).unwrap(), "d ");
        assert_eq!(m.row_text(3).unwrap(), "  ");
    }

    #[test]
    fn mirror_resize_preserves_overlap() {
        let mut m = sized_mirror(3, 2);
        m.apply(&WireOp::Put {
            offset: 0,
            text: "abc".into(),
        });
        m.apply(&WireOp::Resize {
            width: 5,
            height: 3,
        });
        assert_eq!(m.row_text(0).unwrap(), "abc  ");
    }

    #[test]
    fn flush_updates_cursor_and_mode() {
        let mut m = sized_mirror(4, 2);
        m.apply(&WireOp::Flush {
            mode: Mode::INSERT | Mode::MOUSE_ON,
            x: 2,
            y: 1,
            attr: 0,
            ch: ' ',
            width: 1,
        });
        assert_eq!(m.cursor(), (2, 1));
        assert!(m.mode().contains(Mode::INSERT));
    }

    // ── Client frames ───────────────────────────────────────────────────

    #[test]
    fn keyboard_frame_is_raw_utf8() {
        let mut bytes = vec![Op::Keyboard as u8];
        bytes.extend_from_slice("iHello<Esc>".as_bytes());
        assert_eq!(
            parse_client_frame(&bytes),
            Some(ClientFrame::Keyboard("iHello<Esc>".into()))
        );
    }

    #[test]
    fn resize_frame_is_fixed_width() {
        let bytes = [Op::Resize as u8, 0x00, 0x78, 0x00, 0x28];
        assert_eq!(
            parse_client_frame(&bytes),
            Some(ClientFrame::Resize {
                cols: 120,
                rows: 40
            })
        );
    }

    #[test]
    fn truncated_resize_frame_is_none() {
        assert_eq!(parse_client_frame(&[Op::Resize as u8, 0x00]), None);
    }

    #[test]
    fn unexpected_frame_is_none() {
        assert_eq!(parse_client_frame(&[Op::Put as u8, 1, 2]), None);
        assert_eq!(parse_client_frame(&[]), None);
    }
}
