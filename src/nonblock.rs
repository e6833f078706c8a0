use std::io::{self, ErrorKind, Read, Write};

/// Outcome of a single non-blocking I/O attempt.
#[derive(Debug)]
pub enum IoStatus {
    /// Number of bytes transferred; never zero for a non-empty buffer.
    Success(usize),
    /// Nothing can be transferred until the next readiness event.
    WouldBlock,
    /// Peer has closed the stream.
    Shutdown,
    Err(io::Error),
}

impl IoStatus {
    fn from_result(res: io::Result<usize>, requested: usize) -> Self {
        match res {
            Ok(0) if requested > 0 => IoStatus::Shutdown,
            Ok(len) => IoStatus::Success(len),
            Err(err) => match err.kind() {
                ErrorKind::WouldBlock | ErrorKind::Interrupted => IoStatus::WouldBlock,
                _ => IoStatus::Err(err),
            },
        }
    }
}

/// Reading from a source which was put into non-blocking mode.
pub trait ReadNonblocking: Read {
    fn read_nonblocking(&mut self, buf: &mut [u8]) -> IoStatus {
        let requested = buf.len();
        IoStatus::from_result(self.read(buf), requested)
    }
}

impl<R: Read + ?Sized> ReadNonblocking for R {}

/// Writing into a sink which was put into non-blocking mode.
pub trait WriteNonblocking: Write {
    fn write_nonblocking(&mut self, buf: &[u8]) -> IoStatus {
        match IoStatus::from_result(self.write(buf), buf.len()) {
            // A full send buffer may be reported as a zero-length write.
            IoStatus::Shutdown => IoStatus::WouldBlock,
            IoStatus::Err(err) if err.kind() == ErrorKind::WriteZero => IoStatus::WouldBlock,
            status => status,
        }
    }
}

impl<W: Write + ?Sized> WriteNonblocking for W {}
