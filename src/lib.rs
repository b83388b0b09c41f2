mod err;
pub use err::*;

pub mod config;
pub mod ftp;
pub mod pool;
pub mod rudp;
pub mod stream;

pub use config::{Config, RudpConfig};
pub use ftp::FtpServer;
