// SPDX-License-Identifier: MIT
//
// End-to-end protocol tests: every payload a screen emits is replayed
// through the reference decoder into a Mirror, and the mirror must
// agree with the live buffer. This is the contract independent client
// implementations rely on — if these pass, a client that implements
// the documented opcodes renders what the server has.

use std::io;
use std::sync::{Arc, Mutex};

use pretty_assertions::assert_eq;
use vmux::{Mirror, RedrawEvent, Screen, Value, WireOp};

/// A sink that shares its received bytes with the test.
#[derive(Clone, Default)]
struct TestSink(Arc<Mutex<Vec<u8>>>);

impl TestSink {
    fn drain(&self) -> Vec<u8> {
        std::mem::take(&mut *self.0.lock().unwrap())
    }
}

impl io::Write for TestSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn ev(name: &str, args: Vec<Value>) -> RedrawEvent {
    RedrawEvent::single(name, args)
}

fn goto(y: i64, x: i64) -> RedrawEvent {
    ev("cursor_goto", vec![Value::from(y), Value::from(x)])
}

fn put(s: &str) -> RedrawEvent {
    ev("put", vec![Value::from(s)])
}

fn highlight(entries: Vec<(&str, Value)>) -> RedrawEvent {
    ev(
        "highlight_set",
        vec![Value::Map(
            entries.into_iter().map(|(k, v)| (k.to_owned(), v)).collect(),
        )],
    )
}

/// A varied workload touching most of the op vocabulary.
fn workload() -> Vec<Vec<RedrawEvent>> {
    vec![
        vec![
            ev("update_fg", vec![Value::from(0x00dd_dddd_i64)]),
            ev("update_bg", vec![Value::from(0x0010_1020_i64)]),
            ev("clear", vec![]),
        ],
        vec![goto(0, 0), put("alpha")],
        vec![
            highlight(vec![("bold", Value::from(true))]),
            goto(1, 0),
            put("bbbbb"),
        ],
        vec![
            highlight(vec![
                ("foreground", Value::from(0x00ff_8800_i64)),
                ("undercurl", Value::from(true)),
            ]),
            goto(2, 1),
            put("c中c"),
        ],
        vec![ev("scroll", vec![Value::from(1)])],
        vec![
            highlight(vec![]),
            goto(3, 0),
            put("dd"),
            ev("eol_clear", vec![]),
        ],
        vec![ev("scroll", vec![Value::from(-2)])],
        vec![
            ev("set_title", vec![Value::from("proof")]),
            ev("mode_change", vec![Value::from("insert")]),
            goto(4, 2),
            put("eee"),
        ],
    ]
}

fn assert_grid_chars_match(screen: &Screen, mirror: &Mirror) {
    assert_eq!(u32::from(screen.width()), mirror.width());
    assert_eq!(u32::from(screen.height()), mirror.height());
    for y in 0..screen.height() {
        assert_eq!(
            screen.row_text(y).unwrap(),
            mirror.row_text(u32::from(y)).unwrap(),
            "row {y}"
        );
    }
}

fn assert_grid_attrs_match(screen: &Screen, mirror: &Mirror) {
    for y in 0..screen.height() {
        for x in 0..screen.width() {
            assert_eq!(
                screen.cell_attrs(x, y),
                mirror.cell_attrs(u32::from(x), u32::from(y)),
                "attrs at ({x},{y})"
            );
        }
    }
}

// ── Attach resync ───────────────────────────────────────────────────────────

#[test]
fn attach_resync_reconstructs_arbitrary_state() {
    let mut screen = Screen::new(5, 5);

    // Mutate while detached — none of this history is available to the
    // sink that attaches later.
    for batch in workload() {
        screen.apply_redraw(&batch).unwrap();
    }

    let sink = TestSink::default();
    screen.attach(Box::new(sink.clone())).unwrap();

    let mut mirror = Mirror::new();
    mirror.replay(&sink.drain()).unwrap();

    assert_grid_chars_match(&screen, &mirror);
    assert_grid_attrs_match(&screen, &mirror);
    let (cx, cy) = screen.cursor();
    assert_eq!(mirror.cursor(), (u32::from(cx), u32::from(cy)));
}

#[test]
fn resync_is_independent_of_prior_flush_count() {
    // Same workload, but flushed incrementally to a first sink before
    // the second sink attaches. The second sink's view must equal the
    // fully-detached case: resync owes nothing to incremental history.
    let mut screen = Screen::new(5, 5);
    let first = TestSink::default();
    screen.attach(Box::new(first.clone())).unwrap();
    for batch in workload() {
        screen.apply_redraw(&batch).unwrap();
    }

    let second = TestSink::default();
    screen.attach(Box::new(second.clone())).unwrap();

    let mut mirror = Mirror::new();
    mirror.replay(&second.drain()).unwrap();
    assert_grid_chars_match(&screen, &mirror);
    assert_grid_attrs_match(&screen, &mirror);
}

// ── Incremental stream ──────────────────────────────────────────────────────

#[test]
fn incremental_stream_tracks_live_buffer() {
    let mut screen = Screen::new(6, 4);
    let sink = TestSink::default();
    screen.attach(Box::new(sink.clone())).unwrap();

    let mut mirror = Mirror::new();
    mirror.replay(&sink.drain()).unwrap();

    for batch in workload() {
        screen.apply_redraw(&batch).unwrap();
        mirror.replay(&sink.drain()).unwrap();
        assert_grid_chars_match(&screen, &mirror);
    }
    assert_eq!(mirror.title(), "proof");
}

#[test]
fn resize_stream_keeps_mirror_in_step() {
    let mut screen = Screen::new(8, 3);
    let sink = TestSink::default();
    screen.attach(Box::new(sink.clone())).unwrap();
    let mut mirror = Mirror::new();
    mirror.replay(&sink.drain()).unwrap();

    screen
        .apply_redraw(&[goto(0, 0), put("hold fast")])
        .unwrap();
    screen
        .apply_redraw(&[ev("resize", vec![Value::from(12), Value::from(5)])])
        .unwrap();
    screen.apply_redraw(&[goto(4, 0), put("below")]).unwrap();

    mirror.replay(&sink.drain()).unwrap();
    assert_grid_chars_match(&screen, &mirror);
    // The overlap survived the resize on both sides.
    assert_eq!(&mirror.row_text(0).unwrap()[..8], "hold fas");
}

#[test]
fn detach_loses_nothing_for_the_next_sink() {
    let mut screen = Screen::new(6, 2);
    let first = TestSink::default();
    screen.attach(Box::new(first.clone())).unwrap();
    screen.apply_redraw(&[put("one")]).unwrap();

    screen.detach();
    // Mutations while nobody is listening.
    screen
        .apply_redraw(&[goto(1, 0), put("two"), ev("set_title", vec![Value::from("t2")])])
        .unwrap();

    let second = TestSink::default();
    screen.attach(Box::new(second.clone())).unwrap();
    let mut mirror = Mirror::new();
    mirror.replay(&second.drain()).unwrap();

    assert_grid_chars_match(&screen, &mirror);
    assert_eq!(mirror.row_text(1).unwrap(), "two   ");
}

// ── Palette economy ─────────────────────────────────────────────────────────

#[test]
fn palette_is_taught_once_per_sink() {
    let mut screen = Screen::new(6, 2);
    let sink = TestSink::default();
    screen.attach(Box::new(sink.clone())).unwrap();
    sink.drain();

    let styled = |text: &str| {
        vec![
            highlight(vec![("bold", Value::from(true))]),
            goto(0, 0),
            put(text),
        ]
    };

    screen.apply_redraw(&styled("aa")).unwrap();
    let first: Vec<WireOp> = vmux::Decoder::decode_all(&sink.drain()).unwrap();
    assert_eq!(
        first
            .iter()
            .filter(|o| matches!(o, WireOp::Palette { .. }))
            .count(),
        1
    );

    // Two more flushes with no new attribute sets: silence.
    screen.apply_redraw(&styled("bb")).unwrap();
    screen.apply_redraw(&styled("cc")).unwrap();
    let rest: Vec<WireOp> = vmux::Decoder::decode_all(&sink.drain()).unwrap();
    assert_eq!(
        rest.iter()
            .filter(|o| matches!(o, WireOp::Palette { .. }))
            .count(),
        0
    );
}

// ── Wide characters ─────────────────────────────────────────────────────────

#[test]
fn wide_characters_survive_resync() {
    let mut screen = Screen::new(6, 1);
    screen.apply_redraw(&[put("a日b")]).unwrap();

    let sink = TestSink::default();
    screen.attach(Box::new(sink.clone())).unwrap();
    let mut mirror = Mirror::new();
    mirror.replay(&sink.drain()).unwrap();

    assert_eq!(mirror.row_text(0).unwrap(), "a日 b  ");
    assert_grid_chars_match(&screen, &mirror);
}
