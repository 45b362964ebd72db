//! # Console
//!
//! Serialized output for loaded programs. Two logical streams share one
//! transport; a single lock keeps concurrent prints from interleaving within
//! a call.

use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::Arc;
use core::fmt::{self, Write};

use spin::Mutex;

/// Logical output stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Stream {
    /// Standard output
    Out = 1,
    /// Error output
    Err = 2,
}

impl Stream {
    /// Map a raw stream id; anything but 2 is standard output
    pub fn from_raw(id: u32) -> Self {
        if id == Self::Err as u32 {
            Self::Err
        } else {
            Self::Out
        }
    }
}

/// Console writer trait
pub trait ConsoleWriter: Send {
    /// Write a single byte
    fn write_byte(&mut self, stream: Stream, byte: u8);

    /// Write a string
    fn write_str(&mut self, stream: Stream, s: &str) {
        for byte in s.bytes() {
            self.write_byte(stream, byte);
        }
    }

    /// Flush output
    fn flush(&mut self) {}
}

/// Writer that drops everything
pub struct NullConsole;

impl ConsoleWriter for NullConsole {
    fn write_byte(&mut self, _stream: Stream, _byte: u8) {}
}

/// Writer that keeps each stream in a shared buffer; clones see the same text.
#[derive(Clone, Default)]
pub struct BufferConsole {
    out: Arc<Mutex<String>>,
    err: Arc<Mutex<String>>,
}

impl BufferConsole {
    /// Create empty buffers
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything written to `stream` so far
    pub fn contents(&self, stream: Stream) -> String {
        match stream {
            Stream::Out => self.out.lock().clone(),
            Stream::Err => self.err.lock().clone(),
        }
    }
}

impl ConsoleWriter for BufferConsole {
    fn write_byte(&mut self, stream: Stream, byte: u8) {
        self.write_str(stream, core::str::from_utf8(&[byte]).unwrap_or("?"));
    }

    fn write_str(&mut self, stream: Stream, s: &str) {
        match stream {
            Stream::Out => self.out.lock().push_str(s),
            Stream::Err => self.err.lock().push_str(s),
        }
    }
}

/// A console writer behind a spinlock
pub struct LockedConsole {
    writer: Mutex<Box<dyn ConsoleWriter>>,
}

struct StreamAdapter<'a> {
    writer: &'a mut dyn ConsoleWriter,
    stream: Stream,
}

impl Write for StreamAdapter<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.writer.write_str(self.stream, s);
        Ok(())
    }
}

impl LockedConsole {
    /// Wrap a writer
    pub fn new(writer: impl ConsoleWriter + 'static) -> Self {
        Self {
            writer: Mutex::new(Box::new(writer)),
        }
    }

    /// Console that discards output
    pub fn null() -> Self {
        Self::new(NullConsole)
    }

    /// Write formatted text to `stream` under the lock, then flush
    pub fn print(&self, stream: Stream, args: fmt::Arguments<'_>) {
        let mut guard = self.writer.lock();
        let mut adapter = StreamAdapter {
            writer: &mut **guard,
            stream,
        };
        let _ = adapter.write_fmt(args);
        guard.flush();
    }

    /// Write a string
    pub fn print_str(&self, stream: Stream, s: &str) {
        self.print(stream, format_args!("{}", s));
    }

    /// Write a signed integer in decimal
    pub fn print_int(&self, stream: Stream, value: i64) {
        self.print(stream, format_args!("{}", value));
    }

    /// Write an address in hexadecimal
    pub fn print_pointer(&self, stream: Stream, addr: u64) {
        self.print(stream, format_args!("0x{:x}", addr));
    }
}

impl Default for LockedConsole {
    fn default() -> Self {
        Self::null()
    }
}

// ============================================================================
// TESTS
// ============================================================================
