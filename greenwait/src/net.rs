//! Nonblocking TCP types that park the calling green thread on the wait
//! queue whenever the socket would block.

use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::os::fd::AsRawFd;

use crate::runtime;
use crate::wait::{Deadline, IoWait, WakeReason};

/// Awaits a readiness wait and maps the outcome to `io::Result`.
///
/// A forced wake asks the caller to retry the syscall; if the runtime is
/// shutting down, the retry's next wait fails with the draining error.
async fn ready(wait: IoWait) -> io::Result<()> {
    let resumed = wait.await?;
    match resumed.reason {
        WakeReason::Ready | WakeReason::Forced => Ok(()),
        WakeReason::TimedOut => Err(io::ErrorKind::TimedOut.into()),
        WakeReason::Failed => Err(io::Error::from_raw_os_error(libc::EBADF)),
    }
}

/// A nonblocking TCP listener whose `accept` parks the green thread.
pub struct TcpListener {
    /// Underlying nonblocking socket.
    net: mio::net::TcpListener,
}

impl TcpListener {
    pub fn bind(addr: SocketAddr) -> io::Result<Self> {
        Ok(Self {
            net: mio::net::TcpListener::bind(addr)?,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.net.local_addr()
    }

    /// Accepts the next connection, waiting for readability with no
    /// deadline while none is queued.
    ///
    /// # Examples
    ///
    /// ```ignore
    /// let listener = TcpListener::bind("127.0.0.1:0".parse()?)?;
    /// let (stream, peer) = listener.accept().await?;
    /// ```
    pub async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        loop {
            match self.net.accept() {
                Ok((net, addr)) => return Ok((TcpStream { net }, addr)),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    ready(runtime::readable(self.net.as_raw_fd(), Deadline::Never)).await?;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// A nonblocking TCP stream. Reads and writes that would block park the
/// calling green thread until the socket is ready.
pub struct TcpStream {
    /// Underlying nonblocking socket.
    net: mio::net::TcpStream,
}

impl TcpStream {
    /// Connects to `addr`, parking until the handshake completes.
    pub async fn connect(addr: SocketAddr) -> io::Result<Self> {
        let net = mio::net::TcpStream::connect(addr)?;
        loop {
            ready(runtime::writable(net.as_raw_fd(), Deadline::Never)).await?;
            if let Some(err) = net.take_error()? {
                return Err(err);
            }
            match net.peer_addr() {
                Ok(_) => return Ok(Self { net }),
                Err(e) if e.kind() == io::ErrorKind::NotConnected => continue,
                Err(e) => return Err(e),
            }
        }
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.net.peer_addr()
    }

    pub async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.read_until(buf, Deadline::Never).await
    }

    /// Like [`read`](Self::read), failing with `TimedOut` once `deadline`
    /// passes without data.
    pub async fn read_until(&self, buf: &mut [u8], deadline: Deadline) -> io::Result<usize> {
        loop {
            match (&self.net).read(buf) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    ready(runtime::readable(self.net.as_raw_fd(), deadline)).await?;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    pub async fn write_all(&self, mut buf: &[u8]) -> io::Result<()> {
        while !buf.is_empty() {
            match (&self.net).write(buf) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => buf = &buf[n..],
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    ready(runtime::writable(self.net.as_raw_fd(), Deadline::Never)).await?;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}
