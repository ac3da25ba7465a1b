// SPDX-License-Identifier: MIT
//
// Attribute sets and their interned identities.
//
// Every cell displays with an attribute set: style flag bits plus three
// colors (foreground, background, special — the underline/undercurl
// color). Identical sets must share one numeric identity so the wire can
// select a style with a one-byte varint instead of re-sending twelve
// bytes of color data per cell.
//
// Identity is structural: two sets with equal fields are the same set,
// regardless of when or where they were built. The AttrTable hands out
// ascending non-zero ids on first sight and returns the existing id on
// every later sight. Id 0 is reserved for the session default and is
// never stored in the table — the default's colors travel inline in the
// clear opcode instead of the palette.
//
// The table also tracks a live reference count per id (how many cells
// currently display with it). Zero-count ids are evicted when a clear
// invalidates the palette, except the current-write id, which may be
// about to gain references.

use std::collections::HashMap;

use crate::color::Color;

// ─── Style flags ─────────────────────────────────────────────────────────────

bitflags::bitflags! {
    /// Style bits carried by an attribute set.
    ///
    /// One byte on the wire, in both the clear and palette opcodes.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
    pub struct StyleFlags: u8 {
        /// Swap foreground and background.
        const REVERSE   = 1 << 0;
        /// Italic or oblique glyphs.
        const ITALIC    = 1 << 1;
        /// Increased intensity.
        const BOLD      = 1 << 2;
        /// Straight underline.
        const UNDERLINE = 1 << 3;
        /// Curly underline, drawn with the special color.
        const UNDERCURL = 1 << 4;
    }
}

// ─── CellAttrs ───────────────────────────────────────────────────────────────

/// One attribute set: style bits plus the three display colors.
///
/// A plain value type. Equality is field-by-field, which is what decides
/// whether a new palette entry is needed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct CellAttrs {
    pub flags: StyleFlags,
    pub fg: Color,
    pub bg: Color,
    pub sp: Color,
}

impl CellAttrs {
    /// Build an attribute set from parts.
    #[inline]
    #[must_use]
    pub const fn new(flags: StyleFlags, fg: Color, bg: Color, sp: Color) -> Self {
        Self { flags, fg, bg, sp }
    }
}

// ─── AttrId ──────────────────────────────────────────────────────────────────

/// The interned identity of an attribute set.
///
/// Non-zero ids come from [`AttrTable::intern`]; 0 means "the session
/// default", whose definition travels in the clear opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct AttrId(u32);

impl AttrId {
    /// The reserved default/unset identity.
    pub const DEFAULT: Self = Self(0);

    /// The raw wire value.
    #[inline]
    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Rebuild an id from its wire value.
    #[inline]
    #[must_use]
    pub const fn from_raw(n: u32) -> Self {
        Self(n)
    }

    /// Whether this is the reserved default identity.
    #[inline]
    #[must_use]
    pub const fn is_default(self) -> bool {
        self.0 == 0
    }
}

// ─── AttrTable ───────────────────────────────────────────────────────────────

/// Interning table: attribute set ⇄ identity, plus live reference counts.
///
/// Owned by one screen; there is no process-wide registry. Dropping the
/// screen drops every identity with it.
#[derive(Debug, Default)]
pub struct AttrTable {
    ids: HashMap<CellAttrs, AttrId>,
    defs: HashMap<AttrId, CellAttrs>,
    refs: HashMap<AttrId, usize>,
    next: u32,
}

impl AttrTable {
    /// Create an empty table. The first interned set receives id 1.
    #[must_use]
    pub fn new() -> Self {
        Self {
            ids: HashMap::new(),
            defs: HashMap::new(),
            refs: HashMap::new(),
            next: 1,
        }
    }

    /// The identity for `attrs`, assigning the next unused id on first
    /// sight.
    pub fn intern(&mut self, attrs: CellAttrs) -> AttrId {
        if let Some(&id) = self.ids.get(&attrs) {
            return id;
        }
        let id = AttrId(self.next);
        self.next += 1;
        self.ids.insert(attrs, id);
        self.defs.insert(id, attrs);
        id
    }

    /// The definition behind an id, if it is currently interned.
    #[must_use]
    pub fn get(&self, id: AttrId) -> Option<CellAttrs> {
        self.defs.get(&id).copied()
    }

    /// Number of distinct interned sets.
    #[must_use]
    pub fn len(&self) -> usize {
        self.defs.len()
    }

    /// Whether no sets are interned.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.defs.is_empty()
    }

    /// Count one more cell displaying with `id`.
    pub fn retain(&mut self, id: AttrId) {
        *self.refs.entry(id).or_insert(0) += 1;
    }

    /// Count one less cell displaying with `id`.
    pub fn release(&mut self, id: AttrId) {
        if let Some(n) = self.refs.get_mut(&id) {
            *n = n.saturating_sub(1);
        }
    }

    /// Live reference count for an id.
    #[must_use]
    pub fn refcount(&self, id: AttrId) -> usize {
        self.refs.get(&id).copied().unwrap_or(0)
    }

    /// Drop every reference count, then re-add `count` references to
    /// `id`. Used when a clear rewrites the whole buffer with one set.
    pub fn reset_refs(&mut self, id: AttrId, count: usize) {
        self.refs.clear();
        if count > 0 {
            self.refs.insert(id, count);
        }
    }

    /// Evict interned sets no cell references anymore.
    ///
    /// `keep` survives regardless of count (the current-write set may be
    /// about to gain references). Id 0 is never in the table. Evicted
    /// tuples re-interned later receive a fresh id, which is fine: the
    /// palette was invalidated along with the eviction.
    pub fn evict_unused(&mut self, keep: AttrId) {
        let dead: Vec<AttrId> = self
            .defs
            .keys()
            .copied()
            .filter(|&id| id != keep && self.refcount(id) == 0)
            .collect();
        for id in dead {
            if let Some(attrs) = self.defs.remove(&id) {
                self.ids.remove(&attrs);
            }
            self.refs.remove(&id);
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
