//! FTP engine: one listener, one session thread per connected client.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{SystemTime, UNIX_EPOCH};

use log::{info, warn};
use rand::Rng;

use crate::config::Config;
use crate::pool::PortPool;
use crate::stream::{self, Listener};
use crate::Error;

mod list;
mod paths;
mod session;

pub use session::Session;

pub struct FtpServer {
    shutdown: Arc<AtomicBool>,
    local: SocketAddr,
    handle: Option<thread::JoinHandle<()>>,
}

impl FtpServer {
    /// Binds the command listener and starts accepting on a background
    /// thread. A bind failure is fatal and surfaces here.
    pub fn start(config: Config) -> Result<FtpServer, Error> {
        let config = Arc::new(config);
        let pool = Arc::new(PortPool::new());
        let shutdown = Arc::new(AtomicBool::new(false));

        let addr = SocketAddr::new(config.host, config.port);
        let listener = stream::listen(config.transport, addr, &config.rudp)?;
        let local = listener.local_addr();
        info!("server started, listening on {local} ({:?})", config.transport);

        let handle = {
            let config = config.clone();
            let pool = pool.clone();
            let shutdown = shutdown.clone();
            thread::spawn(move || accept_loop(listener, config, pool, shutdown))
        };

        Ok(FtpServer {
            shutdown,
            local,
            handle: Some(handle),
        })
    }

    /// Address the command listener actually bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    /// Raises the shutdown flag and waits for the listener and every
    /// active session to finish.
    pub fn shutdown(mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn accept_loop(
    mut listener: Box<dyn Listener>,
    config: Arc<Config>,
    pool: Arc<PortPool>,
    shutdown: Arc<AtomicBool>,
) {
    let mut sessions: Vec<thread::JoinHandle<()>> = Vec::new();

    loop {
        if shutdown.load(Ordering::Acquire) {
            info!("no longer accepting connections, server is shutting down");
            break;
        }

        match listener.accept() {
            Ok(client) => {
                info!("new client connected: {}", client.peer_addr());
                let session = Session::new(client, config.clone(), pool.clone(), shutdown.clone());
                sessions.push(thread::spawn(move || session.run()));
            }
            Err(Error::Timeout) => {}
            Err(err) => {
                if shutdown.load(Ordering::Acquire) {
                    break;
                }
                warn!("cannot accept connection: {err}");
            }
        }

        sessions.retain(|session| !session.is_finished());
    }

    let _ = listener.close();

    info!("waiting for all clients to disconnect ...");
    for session in sessions {
        let _ = session.join();
    }
    info!("all sessions finished");
}

/// `Th-<millis><rand>` tag used in the log lines of one session.
fn session_name() -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis())
        .unwrap_or_default();

    format!("Th-{}{}", millis, rand::thread_rng().gen_range(0..10000))
}
