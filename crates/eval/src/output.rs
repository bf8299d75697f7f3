//! Shared output stream handles.
//!
//! The evaluator is single-threaded, so streams are shared through
//! `Rc<RefCell<_>>`: several `-print` nodes can address stdout while a
//! `-fprint` node owns its own file, and tests capture everything in
//! memory.

use std::cell::RefCell;
use std::fmt;
use std::fs::File;
use std::io::{self, BufWriter, IsTerminal, Write};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::rc::Rc;

/// A shared, clonable handle to an output stream.
#[derive(Clone)]
pub struct OutFile {
    inner: Rc<RefCell<Box<dyn Write>>>,
    tty: bool,
}

impl OutFile {
    /// A handle to standard output.
    #[must_use]
    pub fn stdout() -> Self {
        let tty = io::stdout().is_terminal();
        Self::from_writer(io::stdout(), tty)
    }

    /// A handle to standard error.
    #[must_use]
    pub fn stderr() -> Self {
        let tty = io::stderr().is_terminal();
        Self::from_writer(io::stderr(), tty)
    }

    /// Creates (truncating) a file and wraps it in a buffered handle.
    pub fn create(path: &Path) -> io::Result<Self> {
        let file = File::create(path)?;
        Ok(Self::from_writer(BufWriter::new(file), false))
    }

    /// Wraps an arbitrary writer.
    pub fn from_writer<W: Write + 'static>(writer: W, tty: bool) -> Self {
        Self {
            inner: Rc::new(RefCell::new(Box::new(writer))),
            tty,
        }
    }

    /// An in-memory stream plus a handle to read back what was written.
    #[must_use]
    pub fn memory() -> (Self, MemoryBuffer) {
        let buffer = Rc::new(RefCell::new(Vec::new()));
        let sink = MemorySink(Rc::clone(&buffer));
        (Self::from_writer(sink, false), MemoryBuffer(buffer))
    }

    /// Whether the stream is attached to a terminal.
    #[must_use]
    pub fn is_tty(&self) -> bool {
        self.tty
    }

    /// Writes raw bytes.
    pub fn write_all(&self, bytes: &[u8]) -> io::Result<()> {
        self.inner.borrow_mut().write_all(bytes)
    }

    /// Writes a path as raw bytes, without lossy conversion.
    pub fn write_path(&self, path: &Path) -> io::Result<()> {
        self.write_all(path.as_os_str().as_bytes())
    }

    /// Writes formatted text; lets `write!(file, ...)` work on handles.
    pub fn write_fmt(&self, args: fmt::Arguments<'_>) -> io::Result<()> {
        self.inner.borrow_mut().write_fmt(args)
    }

    /// Flushes the underlying writer.
    pub fn flush(&self) -> io::Result<()> {
        self.inner.borrow_mut().flush()
    }
}

struct MemorySink(Rc<RefCell<Vec<u8>>>);

impl Write for MemorySink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.borrow_mut().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Read-back handle for [`OutFile::memory`] streams.
#[derive(Clone)]
pub struct MemoryBuffer(Rc<RefCell<Vec<u8>>>);

impl MemoryBuffer {
    /// The bytes written so far.
    #[must_use]
    pub fn contents(&self) -> Vec<u8> {
        self.0.borrow().clone()
    }

    /// The bytes written so far, as (lossy) text.
    #[must_use]
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.0.borrow()).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_stream_captures_writes() {
        let (file, buffer) = OutFile::memory();
        file.write_all(b"hello ").expect("write");
        write!(file, "{}", 42).expect("write");
        assert_eq!(buffer.text(), "hello 42");
    }

    #[test]
    fn clones_share_the_stream() {
        let (file, buffer) = OutFile::memory();
        let clone = file.clone();
        file.write_all(b"a").expect("write");
        clone.write_all(b"b").expect("write");
        assert_eq!(buffer.text(), "ab");
    }

    #[test]
    fn memory_streams_are_not_terminals() {
        let (file, _) = OutFile::memory();
        assert!(!file.is_tty());
    }

    #[test]
    fn write_path_is_raw_bytes() {
        use std::ffi::OsStr;
        let (file, buffer) = OutFile::memory();
        file.write_path(Path::new(OsStr::from_bytes(b"a b"))).expect("write");
        assert_eq!(buffer.contents(), b"a b");
    }
}
