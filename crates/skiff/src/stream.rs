//! Blocking byte streams handed out by adaptors.

use std::io::{self, Read, Write};

/// Readable end of a file or process output.
///
/// Closing consumes the stream, so it cannot be closed twice.
pub trait ByteSource: Read + Send {
    /// Release the underlying resource.
    fn close(self: Box<Self>) -> io::Result<()>;
}

/// Writable end of a file or process input.
///
/// Closing consumes the stream, so it cannot be closed twice.
pub trait ByteSink: Write + Send {
    /// Flush and release the underlying resource.
    fn close(self: Box<Self>) -> io::Result<()>;
}

impl ByteSource for std::fs::File {
    fn close(self: Box<Self>) -> io::Result<()> {
        drop(self);
        Ok(())
    }
}

impl ByteSink for std::fs::File {
    fn close(mut self: Box<Self>) -> io::Result<()> {
        self.flush()?;
        self.sync_all()
    }
}

impl ByteSource for std::process::ChildStdout {
    fn close(self: Box<Self>) -> io::Result<()> {
        drop(self);
        Ok(())
    }
}

impl ByteSource for std::process::ChildStderr {
    fn close(self: Box<Self>) -> io::Result<()> {
        drop(self);
        Ok(())
    }
}

impl ByteSink for std::process::ChildStdin {
    fn close(mut self: Box<Self>) -> io::Result<()> {
        // Dropping the handle closes the pipe, which the child sees as EOF.
        self.flush()
    }
}

impl ByteSource for io::Cursor<Vec<u8>> {
    fn close(self: Box<Self>) -> io::Result<()> {
        Ok(())
    }
}

/// The three standard streams of a running interactive job.
pub struct InteractiveStreams {
    /// Identifier the scheduler assigned to the job
    pub job_id: String,
    /// Standard input of the job
    pub stdin: Box<dyn ByteSink>,
    /// Standard output of the job
    pub stdout: Box<dyn ByteSource>,
    /// Standard error of the job
    pub stderr: Box<dyn ByteSource>,
}

impl std::fmt::Debug for InteractiveStreams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InteractiveStreams")
            .field("job_id", &self.job_id)
            .finish_non_exhaustive()
    }
}

/// Read until `buf` is full or the source is exhausted.
///
/// A return value smaller than `buf.len()` means end of stream was reached.
pub fn read_full(source: &mut dyn Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match source.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_full_short_read_at_end() {
        let mut source = io::Cursor::new(b"hello world".to_vec());
        let mut buf = [0u8; 8];
        assert_eq!(read_full(&mut source, &mut buf).unwrap_or(0), 8);
        assert_eq!(&buf, b"hello wo");
        assert_eq!(read_full(&mut source, &mut buf).unwrap_or(0), 3);
        assert_eq!(read_full(&mut source, &mut buf).unwrap_or(99), 0);
    }
}
