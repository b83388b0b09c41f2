use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};

use crate::config::Config;
use crate::pool::PortPool;
use crate::stream::{self, Listener, Stream};
use crate::Error;

use super::{list, paths};

/// Read timeout on the command channel; keeps the loop responsive to the
/// server shutdown flag.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

/// Largest command line accepted from a client.
const MAX_COMMAND: usize = 1024;

/// Active-mode data endpoint used until the client sends PORT.
const DEFAULT_DATA_PORT: u16 = 30084;

/// Seconds a passive listener waits for the client to dial in.
const PASSIVE_ACCEPT_TRIES: u32 = 60;

const HELP_TEXT: &str = "214\r\n\
 USER [name], specify the user for authentication.\r\n\
 PASS [password], specify the user's password.\r\n\
 PASV ask the server to open a data port and listen on it.\r\n\
 PORT [h1,h2,h3,h4,p1,p2] set the host and port for the data connection.\r\n\
 LIST [path] list a directory, or a single file, over the data connection.\r\n\
 CWD [path] change the working directory.\r\n\
 PWD print the working directory.\r\n\
 CDUP change the working directory to its parent.\r\n\
 DELE [path] delete the specified file.\r\n\
 MKD [path] create the specified directory.\r\n\
 RMD [path] delete the specified directory and everything below it.\r\n\
 RNFR [old] select the file to rename; must be followed by RNTO.\r\n\
 RNTO [new] rename the file selected by RNFR.\r\n\
 REST [position] set the offset the next RETR starts reading from.\r\n\
 RETR [path] download a file over the data connection.\r\n\
 STOR [path] upload a file over the data connection.\r\n\
 APPE [path] upload a file, appending if it already exists.\r\n\
 TYPE [I|A] switch between binary and ascii transfers.\r\n\
 SYST print the server operating system type.\r\n\
 HELP show this help text.\r\n\
 QUIT close the connection.\r\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TransferMode {
    Ascii,
    Binary,
}

pub struct Session {
    name: String,
    cmd: Box<dyn Stream>,
    config: Arc<Config>,
    pool: Arc<PortPool>,
    shutdown: Arc<AtomicBool>,

    cwd: PathBuf,
    authenticated: bool,
    username: Option<String>,
    mode: TransferMode,
    /// Byte offset the next RETR starts at; consumed by one transfer.
    start_pos: u64,
    /// Set by APPE, consumed by the STOR it delegates to.
    is_append: bool,
    data_ip: IpAddr,
    data_port: u16,
    pasv: bool,
    passive_socket: Option<Box<dyn Listener>>,
    passive_port: Option<u16>,
    rename_source: Option<PathBuf>,
}

impl Session {
    pub fn new(
        cmd: Box<dyn Stream>,
        config: Arc<Config>,
        pool: Arc<PortPool>,
        shutdown: Arc<AtomicBool>,
    ) -> Session {
        Session {
            name: super::session_name(),
            cwd: config.root.clone(),
            cmd,
            config,
            pool,
            shutdown,
            authenticated: false,
            username: None,
            mode: TransferMode::Ascii,
            start_pos: 0,
            is_append: false,
            data_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            data_port: DEFAULT_DATA_PORT,
            pasv: false,
            passive_socket: None,
            passive_port: None,
            rename_source: None,
        }
    }

    pub fn run(mut self) {
        let peer = self.cmd.peer_addr();

        if let Err(err) = self.cmd.send(b"220 Welcome.\r\n") {
            warn!("[{}] could not greet {peer}: {err}", self.name);
            return;
        }

        loop {
            // server admin asked for a shutdown: say goodbye and leave
            if self.shutdown.load(Ordering::Acquire) {
                let _ = self.quit();
                break;
            }

            if self.cmd.set_timeout(Some(COMMAND_TIMEOUT)).is_err() {
                break;
            }

            let line = match self.cmd.receive(MAX_COMMAND) {
                Ok(line) if line.is_empty() => break,
                Ok(line) => line,
                Err(Error::Timeout) => continue,
                Err(err) => {
                    debug!("[{}] command channel lost: {err}", self.name);
                    break;
                }
            };

            let line = String::from_utf8_lossy(&line).trim_end().to_string();
            if line.is_empty() {
                continue;
            }
            info!("[{}] data from client: {line}", self.name);

            let (cmd, arg) = parse_command(&line);
            match self.dispatch(&cmd, arg) {
                Ok(false) => {}
                Ok(true) => break,
                Err(err) => {
                    if self.report_error(&cmd, err) {
                        break;
                    }
                }
            }
        }

        self.close_data_channel(None);
        let _ = self.cmd.close();
        info!("[{}] client {peer} disconnected", self.name);
    }

    /// Returns `Ok(true)` when the session should end.
    fn dispatch(&mut self, cmd: &str, arg: &str) -> Result<bool, Error> {
        match cmd {
            "OPTS" => {
                self.reply("202 UTF8 mode is always enabled. No need to send this command.\r\n")?
            }
            "AUTH" => self.reply("500 Insecure server, it does not support FTP over TLS/SSL.\r\n")?,
            "USER" => self.user(arg)?,
            "PASS" => self.pass(arg)?,
            "SYST" => {
                self.check_auth()?;
                self.reply(&format!("215 {} type.\r\n", std::env::consts::OS))?;
            }
            "TYPE" => self.set_type(arg)?,
            "PWD" | "XPWD" => {
                self.check_auth()?;
                self.reply(&format!("257 \"{}\".\r\n", paths::display(&self.cwd)))?;
            }
            "CWD" | "XCWD" => self.chdir(arg)?,
            "CDUP" | "XCUP" => self.cdup()?,
            "MKD" | "XMKD" => self.mkdir(arg)?,
            "RMD" | "XRMD" => self.rmdir(arg)?,
            "DELE" => self.delete(arg)?,
            "RNFR" => self.rename_from(arg)?,
            "RNTO" => self.rename_to(arg)?,
            "REST" => self.restart(arg)?,
            "LIST" | "NLST" => self.list(arg)?,
            "RETR" => self.retrieve(arg)?,
            "STOR" => self.store(arg)?,
            "APPE" => {
                self.check_auth()?;
                self.is_append = true;
                self.store(arg)?;
            }
            "PASV" => self.passive(arg)?,
            "PORT" | "EPRT" => self.port(arg)?,
            "HELP" => self.reply(HELP_TEXT)?,
            "QUIT" => {
                self.quit()?;
                return Ok(true);
            }
            _ => self.reply("500 Syntax error, command unrecognized.\r\n")?,
        }

        Ok(false)
    }

    /// Maps a handler failure onto a reply code; only a dead command
    /// channel ends the session (returns true).
    fn report_error(&mut self, cmd: &str, err: Error) -> bool {
        let reply = match &err {
            Error::NotAuthenticated => {
                debug!("[{}] {cmd} rejected, user not authenticated", self.name);
                "530 Please log in with USER and PASS first.\r\n".to_string()
            }
            Error::Filesystem(msg) => format!("550 {msg}\r\n"),
            Error::Protocol(msg) => format!("500 {msg}\r\n"),
            _ => {
                warn!("[{}] {cmd} failed: {err}", self.name);
                "500 Operation Failed.\r\n".to_string()
            }
        };

        self.cmd.send(reply.as_bytes()).is_err()
    }

    fn reply(&mut self, text: &str) -> Result<(), Error> {
        debug!("[{}] reply: {}", self.name, text.trim_end());
        self.cmd.send(text.as_bytes())
    }

    fn check_auth(&self) -> Result<(), Error> {
        if self.authenticated {
            Ok(())
        } else {
            Err(Error::NotAuthenticated)
        }
    }

    fn resolve(&self, arg: &str) -> PathBuf {
        paths::resolve(&self.cwd, arg)
    }

    fn user(&mut self, arg: &str) -> Result<(), Error> {
        if arg == self.config.user {
            self.username = Some(arg.to_string());
        } else {
            self.username = None;
        }

        // always ask for a password so user names cannot be probed
        self.reply("331 Please, specify the password.\r\n")
    }

    fn pass(&mut self, arg: &str) -> Result<(), Error> {
        let user_ok = self.username.as_deref() == Some(self.config.user.as_str());

        if user_ok && arg == self.config.password {
            self.authenticated = true;
            self.reply("230 Login successful.\r\n")
        } else {
            self.username = None;
            self.reply("530 Login incorrect.\r\n")
        }
    }

    fn set_type(&mut self, arg: &str) -> Result<(), Error> {
        self.check_auth()?;

        match arg.to_ascii_uppercase().as_str() {
            "I" => {
                self.mode = TransferMode::Binary;
                self.reply("200 Binary mode.\r\n")
            }
            "A" => {
                self.mode = TransferMode::Ascii;
                self.reply("200 Ascii mode.\r\n")
            }
            _ => Err(Error::Protocol(format!("{arg}: unknown mode."))),
        }
    }

    fn chdir(&mut self, arg: &str) -> Result<(), Error> {
        self.check_auth()?;

        let pathname = self.resolve(arg);
        if !pathname.is_dir() {
            return Err(Error::Filesystem(format!(
                "CWD failed, directory {} does not exist.",
                paths::display(&pathname)
            )));
        }

        self.cwd = pathname;
        self.reply("250 CWD Command successful.\r\n")
    }

    fn cdup(&mut self) -> Result<(), Error> {
        self.check_auth()?;

        self.cwd = self.resolve("..");
        self.reply("250 CDUP command successful.\r\n")
    }

    fn mkdir(&mut self, arg: &str) -> Result<(), Error> {
        self.check_auth()?;

        let pathname = self.resolve(arg);
        if pathname.exists() {
            return Err(Error::Filesystem(format!(
                "MKD failed, directory \"{}\" already exists.",
                paths::display(&pathname)
            )));
        }

        fs::create_dir(&pathname)?;
        self.reply("257 Directory created.\r\n")
    }

    fn rmdir(&mut self, arg: &str) -> Result<(), Error> {
        self.check_auth()?;

        let pathname = self.resolve(arg);
        if !pathname.exists() {
            return Err(Error::Filesystem(format!(
                "RMD failed, directory \"{}\" does not exist.",
                paths::display(&pathname)
            )));
        }
        if !self.config.allow_delete {
            return Err(Error::Filesystem(format!(
                "Failed to delete folder {}, server does not allow delete.",
                paths::display(&pathname)
            )));
        }

        fs::remove_dir_all(&pathname)?;
        self.reply("250 Directory deleted.\r\n")
    }

    fn delete(&mut self, arg: &str) -> Result<(), Error> {
        self.check_auth()?;

        let pathname = self.resolve(arg);
        if !pathname.exists() {
            return Err(Error::Filesystem(format!(
                "Failed to delete file {}, file does not exist.",
                paths::display(&pathname)
            )));
        }
        if !self.config.allow_delete {
            return Err(Error::Filesystem(format!(
                "Failed to delete file {}, server does not allow delete.",
                paths::display(&pathname)
            )));
        }

        fs::remove_file(&pathname)?;
        self.reply("250 File deleted.\r\n")
    }

    fn rename_from(&mut self, arg: &str) -> Result<(), Error> {
        self.check_auth()?;

        let pathname = self.resolve(arg);
        if !pathname.exists() {
            return Err(Error::Filesystem(format!(
                "RNFR failed, file/dir {} does not exist.",
                paths::display(&pathname)
            )));
        }

        self.rename_source = Some(pathname);
        self.reply("350 File exists, ready for destination name.\r\n")
    }

    fn rename_to(&mut self, arg: &str) -> Result<(), Error> {
        self.check_auth()?;

        let target = self.resolve(arg);
        if target.exists() {
            return Err(Error::Filesystem(format!(
                "RNTO failed, file/dir {} already exists.",
                paths::display(&target)
            )));
        }
        let Some(source) = self.rename_source.take() else {
            return Err(Error::Filesystem("RNTO failed, send RNFR first.".to_string()));
        };

        fs::rename(&source, &target)?;
        self.reply("250 File or directory renamed successfully.\r\n")
    }

    fn restart(&mut self, arg: &str) -> Result<(), Error> {
        self.check_auth()?;

        self.start_pos = arg
            .parse()
            .map_err(|_| Error::Protocol(format!("REST expects a byte offset, got \"{arg}\".")))?;
        self.reply("250 File position reseted.\r\n")
    }

    fn list(&mut self, arg: &str) -> Result<(), Error> {
        self.check_auth()?;

        let pathname = self.resolve(arg);
        if !pathname.exists() {
            return Err(Error::Filesystem("Couldn't open the file or directory.".to_string()));
        }

        self.reply("150 Starting data transfer.\r\n")?;
        self.with_data_channel(|_, data| send_listing(data, &pathname))?;
        self.reply("226 Operation successful.\r\n")
    }

    fn retrieve(&mut self, arg: &str) -> Result<(), Error> {
        self.check_auth()?;

        if arg.is_empty() {
            return Err(Error::Protocol("Please supply a filename to download.".to_string()));
        }
        let pathname = self.resolve(arg);
        if !pathname.is_file() {
            return Err(Error::Filesystem(format!(
                "The file {} does not exist.",
                paths::display(&pathname)
            )));
        }
        let mut file = File::open(&pathname)?;

        self.reply("150 Opening data connection.\r\n")?;

        // REST applies to exactly this transfer
        let start = std::mem::take(&mut self.start_pos);
        let mode = self.mode;

        self.with_data_channel(move |_, data| {
            file.seek(SeekFrom::Start(start))?;
            match mode {
                TransferMode::Binary => send_binary(&mut file, data),
                TransferMode::Ascii => send_ascii(&mut file, data),
            }
        })?;

        self.reply("226 Transfer completed.\r\n")
    }

    fn store(&mut self, arg: &str) -> Result<(), Error> {
        self.check_auth()?;

        // APPE applies to exactly this transfer
        let append = std::mem::take(&mut self.is_append);

        if arg.is_empty() {
            return Err(Error::Protocol("Please supply a filename to upload.".to_string()));
        }
        let pathname = self.resolve(arg);

        let mut file = if append {
            OpenOptions::new().create(true).append(true).open(&pathname)?
        } else {
            File::create(&pathname)?
        };

        self.reply("150 Opening data connection.\r\n")?;

        self.with_data_channel(move |_, data| loop {
            let chunk = data.receive(1024)?;
            if chunk.is_empty() {
                return Ok(());
            }
            file.write_all(&chunk)?;
        })?;

        self.reply("226 Transfer completed.\r\n")
    }

    fn passive(&mut self, _arg: &str) -> Result<(), Error> {
        self.check_auth()?;

        // re-arming replaces any previous passive listener
        self.close_data_channel(None);

        let port = self.pool.acquire().ok_or(Error::PoolExhausted)?;
        let addr = SocketAddr::new(self.config.host, port);
        let listener = match stream::listen(self.config.transport, addr, &self.config.rudp) {
            Ok(listener) => listener,
            Err(err) => {
                self.pool.release(port);
                return Err(err);
            }
        };
        debug!("[{}] passive listener on {addr}", self.name);

        self.passive_socket = Some(listener);
        self.passive_port = Some(port);
        self.pasv = true;

        let ip = match self.config.host {
            IpAddr::V4(ip) => ip,
            IpAddr::V6(_) => Ipv4Addr::LOCALHOST,
        };
        let [a, b, c, d] = ip.octets();
        self.reply(&format!(
            "227 Entering Passive Mode ({a},{b},{c},{d},{},{}).\r\n",
            port >> 8,
            port & 0xFF
        ))
    }

    fn port(&mut self, arg: &str) -> Result<(), Error> {
        self.check_auth()?;

        // PORT overrides any armed passive listener
        if self.pasv {
            self.close_data_channel(None);
        }

        let (ip, port) = parse_host_port(arg)?;
        self.data_ip = IpAddr::V4(ip);
        self.data_port = port;
        debug!("[{}] active data endpoint {}:{}", self.name, ip, port);

        self.reply("200 PORT command successful.\r\n")
    }

    fn quit(&mut self) -> Result<(), Error> {
        let _ = self.reply("221 Goodbye.\r\n");
        self.close_data_channel(None);
        let _ = self.cmd.close();
        Ok(())
    }

    /// Dials or accepts the secondary channel depending on PASV/PORT
    /// state.
    fn open_data_channel(&mut self) -> Result<Box<dyn Stream>, Error> {
        if self.pasv {
            let listener = self.passive_socket.as_mut().ok_or(Error::NotConnected)?;
            debug!("[{}] waiting for the client on the passive socket", self.name);

            for _ in 0..PASSIVE_ACCEPT_TRIES {
                match listener.accept() {
                    Ok(stream) => return Ok(stream),
                    Err(Error::Timeout) => continue,
                    Err(err) => return Err(err),
                }
            }
            Err(Error::Timeout)
        } else {
            let addr = SocketAddr::new(self.data_ip, self.data_port);
            debug!("[{}] dialing the client at {addr}", self.name);
            stream::connect(self.config.transport, addr, &self.config.rudp)
        }
    }

    /// Runs `body` over a freshly opened data channel; the channel and any
    /// passive listener are torn down on success and failure alike.
    fn with_data_channel<F>(&mut self, body: F) -> Result<(), Error>
    where
        F: FnOnce(&mut Session, &mut Box<dyn Stream>) -> Result<(), Error>,
    {
        match self.open_data_channel() {
            Ok(mut data) => {
                let result = body(self, &mut data);
                self.close_data_channel(Some(data));
                result
            }
            Err(err) => {
                self.close_data_channel(None);
                Err(err)
            }
        }
    }

    /// Ends every data command: the transient stream goes away and a
    /// passive listener, if armed, returns its port to the pool.
    fn close_data_channel(&mut self, data: Option<Box<dyn Stream>>) {
        if let Some(mut stream) = data {
            let _ = stream.close();
        }
        if let Some(mut listener) = self.passive_socket.take() {
            let _ = listener.close();
        }
        if let Some(port) = self.passive_port.take() {
            self.pool.release(port);
        }
        self.pasv = false;
    }
}

/// First four characters, uppercased, form the command; the rest is the
/// argument.
fn parse_command(line: &str) -> (String, &str) {
    let head: String = line.chars().take(4).collect();
    let cmd = head.trim().to_ascii_uppercase();
    let arg = line.get(head.len()..).unwrap_or("").trim();

    (cmd, arg)
}

/// PORT argument: four IP octets and two port halves, comma-separated;
/// the port is `(h5 << 8) + h6`.
fn parse_host_port(arg: &str) -> Result<(Ipv4Addr, u16), Error> {
    let parts: Vec<&str> = arg.split(',').map(str::trim).collect();
    if parts.len() != 6 {
        return Err(Error::Protocol(format!(
            "PORT expects six comma-separated numbers, got {}.",
            parts.len()
        )));
    }

    let mut numbers = [0u8; 6];
    for (slot, part) in numbers.iter_mut().zip(&parts) {
        *slot = part
            .parse()
            .map_err(|_| Error::Protocol(format!("PORT expects numbers in 0-255, got \"{part}\".")))?;
    }

    let ip = Ipv4Addr::new(numbers[0], numbers[1], numbers[2], numbers[3]);
    let port = ((numbers[4] as u16) << 8) | numbers[5] as u16;

    Ok((ip, port))
}

fn send_listing(data: &mut Box<dyn Stream>, pathname: &Path) -> Result<(), Error> {
    if pathname.is_dir() {
        for entry in fs::read_dir(pathname)? {
            let line = list::file_property(&entry?.path())?;
            data.send(format!("{line}\r\n").as_bytes())?;
        }
    } else {
        let line = list::file_property(pathname)?;
        data.send(format!("{line}\r\n").as_bytes())?;
    }

    Ok(())
}

fn send_binary(file: &mut File, data: &mut Box<dyn Stream>) -> Result<(), Error> {
    let mut buf = [0u8; 1024];

    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            return Ok(());
        }
        data.send(&buf[..n])?;
    }
}

/// Every line goes out CRLF-terminated regardless of how the file ends
/// its lines.
fn send_ascii(file: &mut File, data: &mut Box<dyn Stream>) -> Result<(), Error> {
    let mut reader = BufReader::new(file);
    let mut line = String::new();

    loop {
        line.clear();
        if reader.read_line(&mut line)? == 0 {
            return Ok(());
        }

        while line.ends_with('\n') || line.ends_with('\r') {
            line.pop();
        }
        line.push_str("\r\n");

        data.send(line.as_bytes())?;
    }
}
