use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use log::{debug, trace, warn};
use nix::poll::{poll, PollFd, PollFlags};

use crate::config::RudpConfig;
use crate::stream::{Stream, POLL_TICK_MS, SOCKET_MAX_TIMEOUT as STREAM_TIMEOUT};
use crate::Error;

use super::{
    next_seq, slot_index, Packet, PacketType, POST_SYN_PAUSE, RETRANSMIT_EVERY, SOCKET_MAX_TIMEOUT,
};

const POLL_TICK: Duration = Duration::from_millis(POLL_TICK_MS as u64);

/// State shared between the caller-facing stream and the two background
/// loops. `next_seq`, `window` and `unacked` each sit behind their own
/// lock; none is ever held across a network send or a sleep.
#[derive(Debug)]
struct Shared {
    socket: UdpSocket,
    local: SocketAddr,
    cfg: RudpConfig,

    /// Destination for outbound datagrams. Follows the source address of
    /// the latest inbound datagram so the handshake migrates off the
    /// listener port onto the accepted endpoint's socket.
    peer: Mutex<Option<SocketAddr>>,

    next_seq: Mutex<u16>,
    window: Mutex<usize>,
    /// Sequence number to full packet bytes, awaiting acknowledgement.
    unacked: Mutex<HashMap<u16, Vec<u8>>>,

    /// Sequence number of the first DATA packet of the current message.
    first_seq: Mutex<u16>,
    /// Reassembly slots, indexed by sequence distance from `first_seq`.
    slots: Mutex<Vec<Vec<u8>>>,

    connected: Mutex<bool>,
    connected_cv: Condvar,

    /// A finished message waiting for `receive` to take it.
    delivery: Mutex<Option<Vec<u8>>>,
    delivery_cv: Condvar,

    receive_timeout: Mutex<Duration>,
    closed: AtomicBool,
}

impl Shared {
    fn new(socket: UdpSocket, cfg: RudpConfig) -> Result<Shared, Error> {
        let local = socket.local_addr()?;
        let slots = vec![Vec::new(); cfg.slot_count()];

        Ok(Shared {
            socket,
            local,
            cfg,
            peer: Mutex::new(None),
            next_seq: Mutex::new(0),
            window: Mutex::new(1),
            unacked: Mutex::new(HashMap::new()),
            first_seq: Mutex::new(0),
            slots: Mutex::new(slots),
            connected: Mutex::new(false),
            connected_cv: Condvar::new(),
            delivery: Mutex::new(None),
            delivery_cv: Condvar::new(),
            receive_timeout: Mutex::new(STREAM_TIMEOUT),
            closed: AtomicBool::new(false),
        })
    }

    fn peer(&self) -> Result<SocketAddr, Error> {
        self.peer.lock().unwrap().ok_or(Error::NotConnected)
    }

    fn take_seq(&self) -> u16 {
        let mut seq = self.next_seq.lock().unwrap();
        *seq = next_seq(*seq);
        *seq
    }

    fn transmit(&self, pkt: &Packet) -> Result<Vec<u8>, Error> {
        let raw = pkt.encode();
        let peer = self.peer()?;
        self.socket.send_to(&raw, peer)?;
        trace!("{}: sent {:?} seq {} to {}", self.local, pkt.kind, pkt.seq, peer);
        Ok(raw)
    }

    /// SYN and DATA packets are recorded in `unacked` until the matching
    /// ACK arrives.
    fn transmit_tracked(&self, kind: PacketType, payload: Vec<u8>) -> Result<(), Error> {
        let seq = self.take_seq();
        let raw = self.transmit(&Packet { kind, seq, payload })?;
        self.unacked.lock().unwrap().insert(seq, raw);
        Ok(())
    }

    /// END and RST consume a sequence number but are never retransmitted.
    fn transmit_control(&self, kind: PacketType) -> Result<(), Error> {
        let seq = self.take_seq();
        self.transmit(&Packet::control(kind, seq))?;
        Ok(())
    }

    fn send_ack(&self, seq: u16) -> Result<(), Error> {
        self.transmit(&Packet::control(PacketType::Ack, seq))?;
        Ok(())
    }

    fn window(&self) -> usize {
        *self.window.lock().unwrap()
    }

    fn shrink_window(&self) {
        let mut window = self.window.lock().unwrap();
        if *window > 1 {
            *window -= 1;
        }
    }

    fn grow_window(&self) {
        let mut window = self.window.lock().unwrap();
        if *window < self.cfg.max_window {
            *window += 1;
        }
    }

    fn in_flight(&self) -> usize {
        self.unacked.lock().unwrap().len()
    }

    fn mark_connected(&self) {
        *self.connected.lock().unwrap() = true;
        self.connected_cv.notify_all();
    }

    fn mark_closed(&self) {
        self.closed.store(true, Ordering::Release);
        self.connected_cv.notify_all();
        self.delivery_cv.notify_all();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn wait_connected(&self) -> Result<(), Error> {
        let guard = self.connected.lock().unwrap();
        let (guard, _) = self
            .connected_cv
            .wait_timeout_while(guard, self.cfg.retry_budget(), |connected| {
                !*connected && !self.is_closed()
            })
            .unwrap();

        if self.is_closed() {
            return Err(Error::Closed);
        }
        if !*guard {
            return Err(Error::NotConnected);
        }
        Ok(())
    }
}

pub struct RudpStream {
    shared: Arc<Shared>,
    control: Option<thread::JoinHandle<()>>,
    retransmit: Option<thread::JoinHandle<()>>,
}

impl RudpStream {
    /// Active open: SYN towards `addr`, background loops started; the
    /// stream becomes connected once the SYN is acknowledged.
    pub fn connect(addr: SocketAddr, cfg: RudpConfig) -> Result<RudpStream, Error> {
        let socket = UdpSocket::bind(("0.0.0.0", 0))?;
        let shared = Arc::new(Shared::new(socket, cfg)?);

        *shared.peer.lock().unwrap() = Some(addr);
        shared.transmit_tracked(PacketType::Syn, Vec::new())?;

        Ok(RudpStream::with_loops(shared))
    }

    /// Passive side, called by the listener with the peer's SYN already
    /// consumed: acknowledge it from a fresh socket, then run the SYN
    /// exchange from this side.
    pub(crate) fn accepted(
        host: IpAddr,
        peer: SocketAddr,
        syn_seq: u16,
        cfg: RudpConfig,
    ) -> Result<RudpStream, Error> {
        let socket = UdpSocket::bind((host, 0))?;
        let shared = Arc::new(Shared::new(socket, cfg)?);

        *shared.peer.lock().unwrap() = Some(peer);
        *shared.first_seq.lock().unwrap() = next_seq(syn_seq);
        shared.send_ack(syn_seq)?;
        thread::sleep(POST_SYN_PAUSE);
        shared.transmit_tracked(PacketType::Syn, Vec::new())?;

        Ok(RudpStream::with_loops(shared))
    }

    fn with_loops(shared: Arc<Shared>) -> RudpStream {
        let control = {
            let shared = shared.clone();
            thread::spawn(move || control_loop(shared))
        };
        let retransmit = {
            let shared = shared.clone();
            thread::spawn(move || retransmit_loop(shared))
        };

        RudpStream {
            shared,
            control: Some(control),
            retransmit: Some(retransmit),
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.shared.local
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.shared
            .peer
            .lock()
            .unwrap()
            .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 0)))
    }

    /// Sends one message: DATA chunks of up to MTU - 12 bytes under the
    /// send window, a trailing END, then a drain of `unacked`.
    pub fn send(&self, data: &[u8]) -> Result<(), Error> {
        let shared = &self.shared;

        if shared.is_closed() {
            return Err(Error::Closed);
        }
        shared.wait_connected()?;

        for chunk in data.chunks(shared.cfg.max_payload()) {
            let mut waited = 0u32;
            while shared.in_flight() >= shared.window() {
                if shared.is_closed() {
                    return Err(Error::Closed);
                }
                if waited >= shared.cfg.max_retries {
                    shared.unacked.lock().unwrap().clear();
                    return Err(Error::AckDrain);
                }
                waited += 1;
                thread::sleep(shared.cfg.retry_sleep);
            }

            // waiting on the window means packets are getting lost; back
            // the window off one step
            if waited > 0 {
                shared.shrink_window();
            }

            shared.transmit_tracked(PacketType::Data, chunk.to_vec())?;
        }

        shared.transmit_control(PacketType::End)?;

        let mut waited = 0u32;
        while shared.in_flight() > 0 {
            if shared.is_closed() {
                return Err(Error::Closed);
            }
            if waited >= shared.cfg.max_retries {
                shared.unacked.lock().unwrap().clear();
                return Err(Error::AckDrain);
            }
            waited += 1;
            thread::sleep(shared.cfg.retry_sleep);
        }

        Ok(())
    }

    /// Blocks until the control loop finishes a message, then takes the
    /// whole delivery. A closed endpoint yields an empty buffer.
    pub fn receive(&self, _max: usize) -> Result<Vec<u8>, Error> {
        let shared = &self.shared;

        if shared.is_closed() {
            // drain anything that finished before the reset
            if let Some(message) = shared.delivery.lock().unwrap().take() {
                return Ok(message);
            }
            return Ok(Vec::new());
        }
        match shared.wait_connected() {
            Err(Error::Closed) => return Ok(Vec::new()),
            other => other?,
        }

        let timeout = *shared.receive_timeout.lock().unwrap();
        let guard = shared.delivery.lock().unwrap();
        let (mut guard, _) = shared
            .delivery_cv
            .wait_timeout_while(guard, timeout, |delivery| {
                delivery.is_none() && !shared.is_closed()
            })
            .unwrap();

        if let Some(message) = guard.take() {
            return Ok(message);
        }
        drop(guard);

        if shared.is_closed() {
            return Ok(Vec::new());
        }
        Err(Error::Timeout)
    }

    pub fn set_timeout(&self, timeout: Option<Duration>) {
        *self.shared.receive_timeout.lock().unwrap() = timeout.unwrap_or(STREAM_TIMEOUT);
    }

    /// RST to the peer, then both background loops exit on their next
    /// iteration. A second close is a no-op.
    pub fn close(&self) -> Result<(), Error> {
        if self.shared.is_closed() {
            return Ok(());
        }

        if *self.shared.connected.lock().unwrap() {
            if let Err(err) = self.shared.transmit_control(PacketType::Rst) {
                debug!("{}: RST not delivered: {err}", self.shared.local);
            }
        }
        self.shared.mark_closed();

        Ok(())
    }
}

impl Drop for RudpStream {
    fn drop(&mut self) {
        let _ = self.close();
        self.control.take();
        self.retransmit.take();
    }
}

impl Stream for RudpStream {
    fn send(&mut self, data: &[u8]) -> Result<(), Error> {
        RudpStream::send(self, data)
    }

    fn receive(&mut self, max: usize) -> Result<Vec<u8>, Error> {
        RudpStream::receive(self, max)
    }

    fn set_timeout(&mut self, timeout: Option<Duration>) -> Result<(), Error> {
        RudpStream::set_timeout(self, timeout);
        Ok(())
    }

    fn peer_addr(&self) -> SocketAddr {
        RudpStream::peer_addr(self)
    }

    fn close(&mut self) -> Result<(), Error> {
        RudpStream::close(self)
    }
}

/// Receives datagrams and dispatches them by packet type.
fn control_loop(shared: Arc<Shared>) {
    let mut buf = vec![0u8; shared.cfg.mtu];
    let mut idle = Duration::ZERO;

    loop {
        if shared.is_closed() {
            break;
        }

        let mut pfd = [PollFd::new(shared.socket.as_raw_fd(), PollFlags::POLLIN)];
        let ready = match poll(&mut pfd[..], POLL_TICK_MS) {
            Ok(ready) => ready,
            Err(err) => {
                warn!("{}: poll failed: {err}", shared.local);
                break;
            }
        };

        if ready == 0 {
            idle += POLL_TICK;
            if idle >= SOCKET_MAX_TIMEOUT {
                // same bound the underlying socket timeout would enforce;
                // not fatal unless the peer resets
                warn!(
                    "{}: no datagram received for {} seconds",
                    shared.local,
                    idle.as_secs()
                );
                idle = Duration::ZERO;
            }
            continue;
        }
        idle = Duration::ZERO;

        // peek before reading so datagrams looping back from our own
        // address can be rejected; they are consumed either way, else the
        // loop would spin on them
        let from = match shared.socket.peek_from(&mut buf) {
            Ok((_, from)) => from,
            Err(err) => {
                warn!("{}: peek failed: {err}", shared.local);
                continue;
            }
        };
        if from == shared.local {
            trace!("{}: dropping datagram from ourselves", shared.local);
            let _ = shared.socket.recv_from(&mut buf);
            continue;
        }

        let (n, from) = match shared.socket.recv_from(&mut buf) {
            Ok(pair) => pair,
            Err(err) => {
                warn!("{}: receive failed: {err}", shared.local);
                continue;
            }
        };

        // follow the sender so replies reach the socket that actually
        // talks to us
        *shared.peer.lock().unwrap() = Some(from);

        let pkt = match Packet::parse(&buf[..n]) {
            Ok(pkt) => pkt,
            Err(err) => {
                debug!("{}: ignoring datagram from {from}: {err}", shared.local);
                continue;
            }
        };
        trace!("{}: got {:?} seq {} from {from}", shared.local, pkt.kind, pkt.seq);

        match pkt.kind {
            PacketType::Syn => {
                *shared.first_seq.lock().unwrap() = next_seq(pkt.seq);
                if let Err(err) = shared.send_ack(pkt.seq) {
                    warn!("{}: could not ACK SYN: {err}", shared.local);
                }
                thread::sleep(POST_SYN_PAUSE);
            }
            PacketType::Data => {
                // while a finished message waits for the reader, new DATA
                // is neither stored nor acknowledged
                if shared.delivery.lock().unwrap().is_some() {
                    continue;
                }

                let first = *shared.first_seq.lock().unwrap();
                let index = slot_index(pkt.seq, first);
                {
                    let mut slots = shared.slots.lock().unwrap();
                    if index >= slots.len() {
                        debug!(
                            "{}: DATA seq {} outside the {}-slot message window",
                            shared.local,
                            pkt.seq,
                            slots.len()
                        );
                        continue;
                    }
                    slots[index] = pkt.payload;
                }
                if let Err(err) = shared.send_ack(pkt.seq) {
                    warn!("{}: could not ACK DATA: {err}", shared.local);
                }
            }
            PacketType::Ack => {
                let popped = shared.unacked.lock().unwrap().remove(&pkt.seq);
                if let Some(raw) = popped {
                    shared.grow_window();
                    if matches!(Packet::parse(&raw), Ok(p) if p.kind == PacketType::Syn) {
                        debug!("{}: SYN acknowledged, connected", shared.local);
                        shared.mark_connected();
                    }
                }
            }
            PacketType::End => {
                let message = {
                    let mut slots = shared.slots.lock().unwrap();
                    let message = slots.concat();
                    *slots = vec![Vec::new(); shared.cfg.slot_count()];
                    message
                };
                *shared.first_seq.lock().unwrap() = next_seq(pkt.seq);
                *shared.delivery.lock().unwrap() = Some(message);
                shared.delivery_cv.notify_all();
            }
            PacketType::Rst => {
                debug!("{}: RST from {from}, closing", shared.local);
                shared.mark_closed();
                break;
            }
        }
    }

    trace!("{}: control loop finished", shared.local);
}

/// Re-sends everything still waiting for an ACK, every ~7 seconds.
fn retransmit_loop(shared: Arc<Shared>) {
    let mut since_sweep = Duration::ZERO;

    loop {
        if shared.is_closed() {
            break;
        }

        thread::sleep(POLL_TICK);
        since_sweep += POLL_TICK;
        if since_sweep < RETRANSMIT_EVERY {
            continue;
        }
        since_sweep = Duration::ZERO;

        // snapshot under the lock, send outside it
        let pending: Vec<(u16, Vec<u8>)> = shared
            .unacked
            .lock()
            .unwrap()
            .iter()
            .map(|(seq, raw)| (*seq, raw.clone()))
            .collect();

        if pending.is_empty() {
            continue;
        }
        let Ok(peer) = shared.peer() else { continue };

        for (seq, raw) in pending {
            trace!("{}: retransmitting seq {seq} to {peer}", shared.local);
            if let Err(err) = shared.socket.send_to(&raw, peer) {
                warn!("{}: retransmit failed: {err}", shared.local);
                break;
            }
        }
    }

    trace!("{}: retransmit loop finished", shared.local);
}
