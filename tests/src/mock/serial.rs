//! Mock serial sink: captures bytes for assertions.

use spin::Mutex;

static CAPTURED: Mutex<Vec<u8>> = Mutex::new(Vec::new());

pub fn init() {}

pub fn _print(args: core::fmt::Arguments<'_>) {
    use core::fmt::Write;
    struct Sink;
    impl Write for Sink {
        fn write_str(&mut self, s: &str) -> core::fmt::Result {
            CAPTURED.lock().extend_from_slice(s.as_bytes());
            Ok(())
        }
    }
    let _ = Sink.write_fmt(args);
}

pub fn write_bytes(bytes: &[u8]) {
    CAPTURED.lock().extend_from_slice(bytes);
}

/// Test hook: drain everything written so far.
pub fn test_take_output() -> Vec<u8> {
    core::mem::take(&mut *CAPTURED.lock())
}
