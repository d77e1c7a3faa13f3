//! The reliable message channel and listener/acceptor glue: external
//! collaborators with narrow contracts, given a concrete, nonblocking,
//! cooperative-style shape. No internal threads; callers drive readiness
//! themselves by wrapping `mio::net::TcpStream` behind small handles.

use crate::error::{Error, ErrorKind, Result};
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

/// A nonblocking, reliable, in-order, length-delimited duplex byte
/// channel between the server and exactly one client.
pub trait Channel {
    /// Reads whatever bytes are currently available without blocking.
    /// Returns an empty vector if nothing is ready yet. Returns
    /// `Err(Closed)` once the peer has disconnected cleanly.
    fn read_available(&mut self) -> Result<Vec<u8>>;

    /// Writes as many bytes from `buf` as can be written without
    /// blocking; returns the number of bytes actually written. Callers
    /// are responsible for retrying the remainder.
    fn write_available(&mut self, buf: &[u8]) -> Result<usize>;
}

/// Accepts an incoming connection and returns a `Channel`, made
/// nonblocking so the host binary's single thread never stalls waiting
/// for a connection that may never arrive.
pub trait Listener {
    fn accept(&mut self) -> Result<Option<Box<dyn Channel + Send>>>;
}

/// TCP implementation, backed by `mio` (`mio::net::TcpListener`,
/// `mio::net::TcpStream`, both set nonblocking).
pub struct TcpChannel {
    stream: mio::net::TcpStream,
}

impl TcpChannel {
    pub fn new(stream: mio::net::TcpStream) -> Result<TcpChannel> {
        stream.set_nodelay(true).map_err(Error::from)?;
        Ok(TcpChannel { stream })
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.stream.peer_addr()
    }
}

impl Channel for TcpChannel {
    fn read_available(&mut self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            match self.stream.read(&mut buf) {
                Ok(0) => return err!(Closed, desc: "peer closed connection")?,
                Ok(n) => out.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::from(e)),
            }
        }
        Ok(out)
    }

    fn write_available(&mut self, buf: &[u8]) -> Result<usize> {
        let mut written = 0;
        while written < buf.len() {
            match self.stream.write(&buf[written..]) {
                Ok(0) => break,
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::from(e)),
            }
        }
        Ok(written)
    }
}

use crate::error::err;

pub struct TcpListenerChannel {
    listener: mio::net::TcpListener,
}

impl TcpListenerChannel {
    pub fn bind(addr: SocketAddr) -> Result<TcpListenerChannel> {
        let listener = mio::net::TcpListener::bind(addr).map_err(Error::from)?;
        Ok(TcpListenerChannel { listener })
    }

    pub fn mio_listener(&self) -> &mio::net::TcpListener {
        &self.listener
    }
}

impl Listener for TcpListenerChannel {
    fn accept(&mut self) -> Result<Option<Box<dyn Channel + Send>>> {
        match self.listener.accept() {
            Ok((stream, _addr)) => Ok(Some(Box::new(TcpChannel::new(stream)?))),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(Error::from(e)),
        }
    }
}

/// In-memory duplex pipe used by tests and the permutation harness so
/// scenario tests never touch a real socket or depend on OS scheduling.
/// Two `LoopbackChannel`s share a pair of byte queues; bytes written to
/// one side appear as available reads on the other.
struct LoopbackHalf {
    inbound: VecDeque<u8>,
    closed: bool,
}

/// Shared with `Arc<Mutex<_>>` rather than `Rc<RefCell<_>>` so a
/// `LoopbackChannel` is `Send`: tests exercise blocking client calls
/// (`subscribe`, `await_advance`, ...) from a thread other than the one
/// driving `Sequencer::handle_io`.
pub struct LoopbackChannel {
    // what this end writes lands here, for the peer to read
    outbound: Arc<Mutex<LoopbackHalf>>,
    // what the peer writes lands here, for this end to read
    inbound: Arc<Mutex<LoopbackHalf>>,
}

impl LoopbackChannel {
    /// Builds a connected pair: `(server_end, client_end)`.
    pub fn pair() -> (LoopbackChannel, LoopbackChannel) {
        let a = Arc::new(Mutex::new(LoopbackHalf { inbound: VecDeque::new(), closed: false }));
        let b = Arc::new(Mutex::new(LoopbackHalf { inbound: VecDeque::new(), closed: false }));
        let server = LoopbackChannel { outbound: b.clone(), inbound: a.clone() };
        let client = LoopbackChannel { outbound: a, inbound: b };
        (server, client)
    }

    /// Simulates the peer disconnecting: the next `read_available` on
    /// this end will observe EOF once the buffered bytes are drained.
    pub fn close(&mut self) {
        self.outbound.lock().unwrap().closed = true;
        self.inbound.lock().unwrap().closed = true;
    }
}

impl Channel for LoopbackChannel {
    fn read_available(&mut self) -> Result<Vec<u8>> {
        let mut half = self.inbound.lock().unwrap();
        if half.inbound.is_empty() && half.closed {
            return err!(Closed, desc: "loopback peer closed")?;
        }
        let bytes: Vec<u8> = half.inbound.drain(..).collect();
        Ok(bytes)
    }

    fn write_available(&mut self, buf: &[u8]) -> Result<usize> {
        let mut half = self.outbound.lock().unwrap();
        if half.closed {
            return err!(Closed, desc: "loopback peer closed")?;
        }
        half.inbound.extend(buf.iter().copied());
        Ok(buf.len())
    }
}
