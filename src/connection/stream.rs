use std::{
    io::{self, Read, Write},
    net::{Shutdown, TcpStream},
    time::Duration,
};

/// A connected, bidirectional byte stream a [`Connection`](super::Connection)
/// can own.
///
/// The connection keeps independent handles for reading and writing, so the
/// stream must be cloneable into handles sharing one underlying socket.
pub trait Duplex: Read + Write + Send + Sync + 'static {
    fn try_clone(&self) -> io::Result<Self>
    where
        Self: Sized;

    /// Closes both directions, failing any call blocked on the stream.
    fn shutdown(&self) -> io::Result<()>;

    fn set_timeouts(&self, read: Option<Duration>, write: Option<Duration>) -> io::Result<()>;

    /// Human readable description of the remote end, for diagnostics.
    fn peer(&self) -> String;
}

impl Duplex for TcpStream {
    fn try_clone(&self) -> io::Result<Self> {
        TcpStream::try_clone(self)
    }

    fn shutdown(&self) -> io::Result<()> {
        TcpStream::shutdown(self, Shutdown::Both)
    }

    fn set_timeouts(&self, read: Option<Duration>, write: Option<Duration>) -> io::Result<()> {
        self.set_read_timeout(read)?;
        self.set_write_timeout(write)
    }

    fn peer(&self) -> String {
        match self.peer_addr() {
            Ok(addr) => addr.to_string(),
            Err(_) => "<unknown tcp peer>".to_string(),
        }
    }
}

#[cfg(unix)]
impl Duplex for std::os::unix::net::UnixStream {
    fn try_clone(&self) -> io::Result<Self> {
        std::os::unix::net::UnixStream::try_clone(self)
    }

    fn shutdown(&self) -> io::Result<()> {
        std::os::unix::net::UnixStream::shutdown(self, Shutdown::Both)
    }

    fn set_timeouts(&self, read: Option<Duration>, write: Option<Duration>) -> io::Result<()> {
        self.set_read_timeout(read)?;
        self.set_write_timeout(write)
    }

    fn peer(&self) -> String {
        match self.peer_addr() {
            Ok(addr) => match addr.as_pathname() {
                Some(path) => path.display().to_string(),
                None => "<unnamed unix peer>".to_string(),
            },
            Err(_) => "<unknown unix peer>".to_string(),
        }
    }
}
