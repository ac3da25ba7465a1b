// SPDX-License-Identifier: MIT
//
// Drive a screen with a scripted redraw batch and dump the wire payload
// it produces, both as a hex stream and decoded back into opcodes.
//
//   cargo run -p vmux-screen --example demo

use std::io::{self, Write};

use vmux_screen::args::{RedrawEvent, Value};
use vmux_screen::decode::Decoder;
use vmux_screen::screen::Screen;

/// Collects payload bytes so the demo can print them after the fact.
#[derive(Clone, Default)]
struct CaptureSink(std::sync::Arc<std::sync::Mutex<Vec<u8>>>);

impl Write for CaptureSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn main() -> io::Result<()> {
    let mut screen = Screen::new(20, 4);
    let sink = CaptureSink::default();
    screen.attach(Box::new(sink.clone()))?;

    screen.apply_redraw(&[
        RedrawEvent::single(
            "highlight_set",
            vec![Value::Map(vec![("bold".into(), Value::from(true))])],
        ),
        RedrawEvent::single("put", vec![Value::from("hello, wire")]),
        RedrawEvent::single("cursor_goto", vec![Value::from(1), Value::from(0)]),
        RedrawEvent::single("put", vec![Value::from("============")]),
    ])?;

    let bytes = sink.0.lock().unwrap().clone();

    println!("payload: {} bytes", bytes.len());
    for chunk in bytes.chunks(16) {
        let hex: Vec<String> = chunk.iter().map(|b| format!("{b:02x}")).collect();
        println!("  {}", hex.join(" "));
    }

    println!("\ndecoded:");
    match Decoder::decode_all(&bytes) {
        Ok(ops) => {
            for op in ops {
                println!("  {op:?}");
            }
        }
        Err(e) => println!("  decode error: {e}"),
    }

    Ok(())
}
