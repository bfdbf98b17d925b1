//! Byte stream transports a [`Session`](crate::Session) runs over.

#[allow(unused_imports)]
use {
    crate::error::{Error, Result, TrapBug},
    log::{debug, error, info, log, trace, warn},
};

use std::collections::VecDeque;
use std::io::{self, ErrorKind, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

/// Longest a single [`Transport::wait`] blocks before the session
/// checks its state again.
const WAIT_SLICE: Duration = Duration::from_millis(50);

/// A reliable ordered byte stream.
///
/// The session keeps its transport in non-blocking mode. `read` and `write`
/// return [`ErrorKind::WouldBlock`] when no progress can be made, `read`
/// returns `Ok(0)` at end of stream.
pub trait Transport: Send {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;

    fn flush(&mut self) -> io::Result<()>;

    /// Blocks until input may be available, or when `want_write` is set
    /// until output may be accepted. Spurious returns are allowed.
    fn wait(&mut self, want_write: bool) -> io::Result<()>;

    fn set_nonblocking(&mut self, nonblocking: bool) -> io::Result<()>;

    /// Shuts down both directions. Later reads return end of stream.
    fn close(&mut self) -> io::Result<()>;
}

/// A TCP connection
pub struct TcpTransport {
    stream: TcpStream,
    nonblocking: bool,
}

impl TcpTransport {
    /// Connects to `addr`, trying each resolved address in turn.
    ///
    /// `timeout` bounds each connection attempt, the only timeout a
    /// session has.
    pub fn connect(addr: impl ToSocketAddrs, timeout: Option<Duration>) -> Result<Self> {
        let mut last = None;
        for a in addr.to_socket_addrs()? {
            let r = match timeout {
                Some(t) => TcpStream::connect_timeout(&a, t),
                None => TcpStream::connect(a),
            };
            match r {
                Ok(stream) => {
                    debug!("Connected to {a}");
                    return Self::from_stream(stream);
                }
                Err(e) => {
                    debug!("Connecting to {a} failed: {e}");
                    last = Some(e);
                }
            }
        }
        match last {
            Some(e) => Err(e.into()),
            None => Err(Error::BadUsage { msg: "no address to connect" }),
        }
    }

    /// Wraps an established stream, such as one from a `TcpListener`
    pub fn from_stream(stream: TcpStream) -> Result<Self> {
        stream.set_nodelay(true)?;
        Ok(Self { stream, nonblocking: false })
    }
}

impl Transport for TcpTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stream.flush()
    }

    fn wait(&mut self, want_write: bool) -> io::Result<()> {
        // std has no readiness polling. A blocking peek with a timeout
        // waits for input, writes rarely stall so they only get a short wait.
        let t = if want_write { Duration::from_millis(5) } else { WAIT_SLICE };
        self.stream.set_nonblocking(false)?;
        self.stream.set_read_timeout(Some(t))?;
        let mut b = [0u8];
        let r = self.stream.peek(&mut b);
        self.stream.set_read_timeout(None)?;
        self.stream.set_nonblocking(self.nonblocking)?;
        match r {
            Ok(_) => Ok(()),
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn set_nonblocking(&mut self, nonblocking: bool) -> io::Result<()> {
        self.nonblocking = nonblocking;
        self.stream.set_nonblocking(nonblocking)
    }

    fn close(&mut self) -> io::Result<()> {
        match self.stream.shutdown(Shutdown::Both) {
            Err(e) if e.kind() != ErrorKind::NotConnected => Err(e),
            _ => Ok(()),
        }
    }
}

#[derive(Default)]
struct PipeState {
    data: VecDeque<u8>,
    closed: bool,
}

/// One direction of an in-memory pair
#[derive(Default)]
struct Pipe {
    state: Mutex<PipeState>,
    ready: Condvar,
}

impl Pipe {
    fn lock(&self) -> MutexGuard<'_, PipeState> {
        // A panicking peer thread leaves plain bytes behind, still usable
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn close(&self) {
        self.lock().closed = true;
        self.ready.notify_all();
    }
}

/// One end of an in-memory connection, created by [`mem_pair()`].
///
/// Writes never block.
pub struct MemTransport {
    rx: Arc<Pipe>,
    tx: Arc<Pipe>,
    nonblocking: bool,
}

/// Returns two connected in-memory transports, for tests or for running
/// a client and server within one process.
pub fn mem_pair() -> (MemTransport, MemTransport) {
    let a = Arc::new(Pipe::default());
    let b = Arc::new(Pipe::default());
    (
        MemTransport { rx: a.clone(), tx: b.clone(), nonblocking: false },
        MemTransport { rx: b, tx: a, nonblocking: false },
    )
}

impl Transport for MemTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut st = self.rx.lock();
        loop {
            if !st.data.is_empty() {
                let n = buf.len().min(st.data.len());
                for (b, d) in buf.iter_mut().zip(st.data.drain(..n)) {
                    *b = d;
                }
                return Ok(n);
            }
            if st.closed || buf.is_empty() {
                return Ok(0);
            }
            if self.nonblocking {
                return Err(ErrorKind::WouldBlock.into());
            }
            st = self.rx.ready.wait(st).unwrap_or_else(|e| e.into_inner());
        }
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut st = self.tx.lock();
        if st.closed {
            return Err(ErrorKind::BrokenPipe.into());
        }
        st.data.extend(buf);
        drop(st);
        self.tx.ready.notify_all();
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn wait(&mut self, want_write: bool) -> io::Result<()> {
        if want_write {
            return Ok(());
        }
        let st = self.rx.lock();
        if st.data.is_empty() && !st.closed {
            let _ = self.rx.ready.wait_timeout(st, WAIT_SLICE).unwrap_or_else(|e| e.into_inner());
        }
        Ok(())
    }

    fn set_nonblocking(&mut self, nonblocking: bool) -> io::Result<()> {
        self.nonblocking = nonblocking;
        Ok(())
    }

    fn close(&mut self) -> io::Result<()> {
        self.rx.close();
        self.tx.close();
        Ok(())
    }
}

impl Drop for MemTransport {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

#[cfg(test)]
mod tests {
    use crate::sshlog::init_test_log;
    use crate::transport::*;

    #[test]
    fn mem_pair_transfers() {
        init_test_log();
        let (mut a, mut b) = mem_pair();
        b.set_nonblocking(true).unwrap();

        let mut buf = [0u8; 8];
        let e = b.read(&mut buf).unwrap_err();
        assert_eq!(e.kind(), ErrorKind::WouldBlock);

        assert_eq!(a.write(b"hello world").unwrap(), 11);
        assert_eq!(b.read(&mut buf).unwrap(), 8);
        assert_eq!(&buf, b"hello wo");
        assert_eq!(b.read(&mut buf).unwrap(), 3);
        assert_eq!(&buf[..3], b"rld");
    }

    #[test]
    fn mem_pair_close() {
        init_test_log();
        let (mut a, mut b) = mem_pair();
        a.write(b"xy").unwrap();
        a.close().unwrap();

        let mut buf = [0u8; 8];
        // buffered data is still delivered
        assert_eq!(b.read(&mut buf).unwrap(), 2);
        assert_eq!(b.read(&mut buf).unwrap(), 0);
        assert!(b.write(b"z").is_err());
        b.wait(false).unwrap();
    }

    #[test]
    fn mem_pair_blocking_read() {
        init_test_log();
        let (mut a, mut b) = mem_pair();
        let t = std::thread::spawn(move || {
            let mut buf = [0u8; 4];
            let n = b.read(&mut buf).unwrap();
            buf[..n].to_vec()
        });
        std::thread::sleep(Duration::from_millis(20));
        a.write(b"ping").unwrap();
        assert_eq!(t.join().unwrap(), b"ping");
    }

    #[test]
    fn tcp_pair() {
        init_test_log();
        let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = l.local_addr().unwrap();
        let mut c = TcpTransport::connect(addr, Some(Duration::from_secs(5))).unwrap();
        let (s, _) = l.accept().unwrap();
        let mut s = TcpTransport::from_stream(s).unwrap();
        s.set_nonblocking(true).unwrap();

        let mut buf = [0u8; 4];
        assert_eq!(s.read(&mut buf).unwrap_err().kind(), ErrorKind::WouldBlock);
        c.write(b"abc").unwrap();
        c.flush().unwrap();
        s.wait(false).unwrap();
        let mut got = Vec::new();
        while got.len() < 3 {
            match s.read(&mut buf) {
                Ok(n) => got.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == ErrorKind::WouldBlock => s.wait(false).unwrap(),
                Err(e) => panic!("{e}"),
            }
        }
        assert_eq!(got, b"abc");
        c.close().unwrap();
    }
}
