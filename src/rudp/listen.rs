use std::net::{SocketAddr, UdpSocket};
use std::os::fd::AsRawFd;

use log::debug;
use nix::poll::{poll, PollFd, PollFlags};

use crate::config::RudpConfig;
use crate::stream::{Listener, Stream, POLL_TICK_MS};
use crate::Error;

use super::{Packet, PacketType, RudpStream};

pub struct RudpListener {
    socket: UdpSocket,
    local: SocketAddr,
    cfg: RudpConfig,
    closed: bool,
}

impl RudpListener {
    pub fn bind(addr: SocketAddr, cfg: RudpConfig) -> Result<RudpListener, Error> {
        let socket = UdpSocket::bind(addr)?;
        let local = socket.local_addr()?;

        Ok(RudpListener {
            socket,
            local,
            cfg,
            closed: false,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    /// Pulls one datagram off the bound socket; a SYN yields a fresh
    /// endpoint on its own ephemeral socket which acknowledges the SYN and
    /// opens its own side of the handshake.
    pub fn accept(&mut self) -> Result<RudpStream, Error> {
        if self.closed {
            return Err(Error::Closed);
        }

        let mut pfd = [PollFd::new(self.socket.as_raw_fd(), PollFlags::POLLIN)];
        if poll(&mut pfd[..], POLL_TICK_MS)? == 0 {
            return Err(Error::Timeout);
        }

        let mut buf = vec![0u8; self.cfg.mtu];
        let (n, peer) = self.socket.recv_from(&mut buf)?;

        let pkt = Packet::parse(&buf[..n])?;
        if pkt.kind != PacketType::Syn {
            return Err(Error::BadPacket(format!(
                "expected SYN, got {:?} from {peer}",
                pkt.kind
            )));
        }
        debug!("{}: SYN from {peer}", self.local);

        RudpStream::accepted(self.local.ip(), peer, pkt.seq, self.cfg.clone())
    }

    pub fn close(&mut self) {
        self.closed = true;
    }
}

impl Listener for RudpListener {
    fn accept(&mut self) -> Result<Box<dyn Stream>, Error> {
        RudpListener::accept(self).map(|stream| Box::new(stream) as Box<dyn Stream>)
    }

    fn local_addr(&self) -> SocketAddr {
        self.local
    }

    fn close(&mut self) -> Result<(), Error> {
        RudpListener::close(self);
        Ok(())
    }
}
