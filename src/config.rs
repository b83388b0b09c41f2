use std::net::{IpAddr, Ipv4Addr, ToSocketAddrs};
use std::path::PathBuf;
use std::time::Duration;

use crate::rudp::HEADER_LEN;
use crate::stream::Transport;

/// Port the server listens on for incoming command connections.
pub const SERVER_PORT: u16 = 20383;

/// The sole credential pair accepted by the server.
pub const DEFAULT_USER: &str = "user";
pub const DEFAULT_PASSWORD: &str = "1234";

/// Largest message a single reassembly buffer has to hold; dimensions the
/// per-message slot array.
pub(crate) const MAX_MESSAGE: usize = 5000;

/// Tunables for the RUDP engine.
#[derive(Debug, Clone)]
pub struct RudpConfig {
    /// Maximum size of one datagram, header included.
    pub mtu: usize,
    /// Upper bound on simultaneously unacknowledged packets.
    pub max_window: usize,
    /// Pause between send retries while the window is saturated.
    pub retry_sleep: Duration,
    /// Retry bound; past it the send fails.
    pub max_retries: u32,
}

impl Default for RudpConfig {
    fn default() -> Self {
        RudpConfig {
            mtu: 1024,
            max_window: 10,
            retry_sleep: Duration::from_millis(50),
            max_retries: 600,
        }
    }
}

impl RudpConfig {
    /// Payload bytes that fit one datagram next to the 12-byte header.
    pub fn max_payload(&self) -> usize {
        self.mtu - HEADER_LEN
    }

    pub(crate) fn slot_count(&self) -> usize {
        (MAX_MESSAGE + self.max_payload() - 1) / self.max_payload()
    }

    /// Total budget a blocked send may burn before giving up.
    pub(crate) fn retry_budget(&self) -> Duration {
        self.retry_sleep * self.max_retries
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub transport: Transport,
    /// Address the command listener (and passive data listeners) bind to.
    pub host: IpAddr,
    pub port: u16,
    pub user: String,
    pub password: String,
    /// Gates DELE and RMD.
    pub allow_delete: bool,
    /// Initial working directory handed to every session.
    pub root: PathBuf,
    pub rudp: RudpConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            transport: Transport::Tcp,
            host: default_host(),
            port: SERVER_PORT,
            user: DEFAULT_USER.to_string(),
            password: DEFAULT_PASSWORD.to_string(),
            allow_delete: true,
            root: PathBuf::from("/"),
            rudp: RudpConfig::default(),
        }
    }
}

/// IPv4 address of the local hostname, or 127.0.0.1 when it does not
/// resolve.
pub fn default_host() -> IpAddr {
    let localhost = IpAddr::V4(Ipv4Addr::LOCALHOST);

    let Ok(name) = nix::unistd::gethostname() else {
        return localhost;
    };
    let Some(name) = name.to_str() else {
        return localhost;
    };

    match (name, 0u16).to_socket_addrs() {
        Ok(mut addrs) => addrs
            .find(|addr| addr.is_ipv4())
            .map(|addr| addr.ip())
            .unwrap_or(localhost),
        Err(_) => localhost,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rudp_defaults_match_the_wire_constants() {
        let cfg = RudpConfig::default();

        assert_eq!(cfg.mtu, 1024);
        assert_eq!(cfg.max_payload(), 1012);
        assert_eq!(cfg.slot_count(), 5);
        assert_eq!(cfg.retry_budget(), Duration::from_secs(30));
    }

    #[test]
    fn default_host_is_routable_v4() {
        assert!(default_host().is_ipv4());
    }
}
