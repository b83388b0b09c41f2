use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::os::fd::AsRawFd;
use std::time::Duration;

use nix::poll::{poll, PollFd, PollFlags};

use crate::config::RudpConfig;
use crate::rudp::{RudpListener, RudpStream};
use crate::Error;

/// Idle bound applied to freshly created streams.
pub const SOCKET_MAX_TIMEOUT: Duration = Duration::from_secs(60);

/// Granularity of the bounded waits in `Listener::accept` and the RUDP
/// background loops; a closed socket or a raised shutdown flag is observed
/// within one tick.
pub(crate) const POLL_TICK_MS: i32 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Tcp,
    Rudp,
}

/// One side of an established reliable byte channel.
pub trait Stream: Send {
    /// Sends the whole buffer.
    fn send(&mut self, data: &[u8]) -> Result<(), Error>;

    /// One logical delivery of up to `max` bytes; an empty buffer means the
    /// peer shut down.
    fn receive(&mut self, max: usize) -> Result<Vec<u8>, Error>;

    /// Bounds subsequent blocking calls; `None` restores the 60 s default.
    fn set_timeout(&mut self, timeout: Option<Duration>) -> Result<(), Error>;

    fn peer_addr(&self) -> SocketAddr;

    fn close(&mut self) -> Result<(), Error>;
}

pub trait Listener: Send {
    /// Waits a bounded amount of time for one peer; `Error::Timeout` means
    /// nobody dialed in and the caller may check its shutdown flag before
    /// trying again.
    fn accept(&mut self) -> Result<Box<dyn Stream>, Error>;

    fn local_addr(&self) -> SocketAddr;

    fn close(&mut self) -> Result<(), Error>;
}

pub fn connect(
    transport: Transport,
    addr: SocketAddr,
    rudp: &RudpConfig,
) -> Result<Box<dyn Stream>, Error> {
    match transport {
        Transport::Tcp => Ok(Box::new(TcpTransport::connect(addr)?)),
        Transport::Rudp => Ok(Box::new(RudpStream::connect(addr, rudp.clone())?)),
    }
}

pub fn listen(
    transport: Transport,
    addr: SocketAddr,
    rudp: &RudpConfig,
) -> Result<Box<dyn Listener>, Error> {
    match transport {
        Transport::Tcp => Ok(Box::new(TcpAcceptor::bind(addr)?)),
        Transport::Rudp => Ok(Box::new(RudpListener::bind(addr, rudp.clone())?)),
    }
}

pub struct TcpTransport {
    inner: TcpStream,
    peer: SocketAddr,
}

impl TcpTransport {
    pub fn connect(addr: SocketAddr) -> Result<Self, Error> {
        let inner = TcpStream::connect_timeout(&addr, SOCKET_MAX_TIMEOUT)?;
        inner.set_read_timeout(Some(SOCKET_MAX_TIMEOUT))?;
        inner.set_write_timeout(Some(SOCKET_MAX_TIMEOUT))?;

        Ok(TcpTransport { inner, peer: addr })
    }
}

impl Stream for TcpTransport {
    fn send(&mut self, data: &[u8]) -> Result<(), Error> {
        self.inner.write_all(data)?;
        Ok(())
    }

    fn receive(&mut self, max: usize) -> Result<Vec<u8>, Error> {
        let mut buf = vec![0u8; max];

        match self.inner.read(&mut buf) {
            Ok(n) => {
                buf.truncate(n);
                Ok(buf)
            }
            Err(err) if matches!(err.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                Err(Error::Timeout)
            }
            Err(err) => Err(err.into()),
        }
    }

    fn set_timeout(&mut self, timeout: Option<Duration>) -> Result<(), Error> {
        let timeout = timeout.or(Some(SOCKET_MAX_TIMEOUT));
        self.inner.set_read_timeout(timeout)?;
        self.inner.set_write_timeout(timeout)?;
        Ok(())
    }

    fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    fn close(&mut self) -> Result<(), Error> {
        // a peer that is already gone is not worth surfacing
        match self.inner.shutdown(Shutdown::Both) {
            Err(err) if err.kind() != io::ErrorKind::NotConnected => Err(err.into()),
            _ => Ok(()),
        }
    }
}

pub struct TcpAcceptor {
    inner: TcpListener,
    local: SocketAddr,
}

impl TcpAcceptor {
    pub fn bind(addr: SocketAddr) -> Result<Self, Error> {
        let inner = TcpListener::bind(addr)?;
        // nonblocking so accept can poll with a timeout
        inner.set_nonblocking(true)?;
        let local = inner.local_addr()?;

        Ok(TcpAcceptor { inner, local })
    }
}

impl Listener for TcpAcceptor {
    fn accept(&mut self) -> Result<Box<dyn Stream>, Error> {
        let mut pfd = [PollFd::new(self.inner.as_raw_fd(), PollFlags::POLLIN)];
        if poll(&mut pfd[..], POLL_TICK_MS)? == 0 {
            return Err(Error::Timeout);
        }

        match self.inner.accept() {
            Ok((stream, peer)) => {
                stream.set_nonblocking(false)?;
                stream.set_read_timeout(Some(SOCKET_MAX_TIMEOUT))?;
                stream.set_write_timeout(Some(SOCKET_MAX_TIMEOUT))?;
                Ok(Box::new(TcpTransport { inner: stream, peer }))
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => Err(Error::Timeout),
            Err(err) => Err(err.into()),
        }
    }

    fn local_addr(&self) -> SocketAddr {
        self.local
    }

    fn close(&mut self) -> Result<(), Error> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    #[test]
    fn tcp_round_trip_and_shutdown() {
        let mut listener = TcpAcceptor::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = listener.local_addr();

        let server = thread::spawn(move || {
            let mut peer = loop {
                match listener.accept() {
                    Ok(peer) => break peer,
                    Err(Error::Timeout) => continue,
                    Err(err) => panic!("accept failed: {err}"),
                }
            };
            let got = peer.receive(64).unwrap();
            peer.send(&got).unwrap();
            peer.close().unwrap();
        });

        let mut client = TcpTransport::connect(addr).unwrap();
        client.send(b"ping").unwrap();
        assert_eq!(client.receive(64).unwrap(), b"ping");
        // peer shut down: next delivery is empty
        assert!(client.receive(64).unwrap().is_empty());
        client.close().unwrap();

        server.join().unwrap();
    }

    #[test]
    fn accept_times_out_when_nobody_dials() {
        let mut listener = TcpAcceptor::bind("127.0.0.1:0".parse().unwrap()).unwrap();

        assert!(matches!(listener.accept(), Err(Error::Timeout)));
    }
}
