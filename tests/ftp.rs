use std::fs;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener, TcpStream};
use std::path::PathBuf;
use std::time::Duration;

use rftp::{Config, FtpServer};

struct Ftp {
    stream: TcpStream,
    reader: BufReader<TcpStream>,
}

impl Ftp {
    fn connect(addr: SocketAddr) -> Ftp {
        let stream = TcpStream::connect(addr).unwrap();
        stream.set_read_timeout(Some(Duration::from_secs(15))).unwrap();
        let reader = BufReader::new(stream.try_clone().unwrap());

        Ftp { stream, reader }
    }

    fn read_reply(&mut self) -> String {
        let mut line = String::new();
        self.reader.read_line(&mut line).unwrap();
        line
    }

    fn cmd(&mut self, command: &str) -> String {
        self.stream.write_all(format!("{command}\r\n").as_bytes()).unwrap();
        self.read_reply()
    }

    fn send(&mut self, command: &str) {
        self.stream.write_all(format!("{command}\r\n").as_bytes()).unwrap();
    }
}

fn scratch_dir(tag: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("rftp-ftp-{tag}-{}", std::process::id()));
    let _ = fs::remove_dir_all(&dir);
    fs::create_dir_all(&dir).unwrap();
    dir
}

fn start_server(root: &PathBuf) -> FtpServer {
    let config = Config {
        host: IpAddr::V4(Ipv4Addr::LOCALHOST),
        port: 0,
        root: root.clone(),
        ..Config::default()
    };

    FtpServer::start(config).unwrap()
}

fn login(ftp: &mut Ftp, root: &PathBuf) {
    assert!(ftp.read_reply().starts_with("220 Welcome."));
    assert!(ftp.cmd("USER user").starts_with("331"));
    assert!(ftp.cmd("PASS 1234").starts_with("230"));
    assert!(ftp.cmd(&format!("CWD {}", root.display())).starts_with("250"));
}

fn pasv(ftp: &mut Ftp) -> SocketAddr {
    let reply = ftp.cmd("PASV");
    assert!(reply.starts_with("227"), "unexpected PASV reply: {reply}");

    let digits = reply.split('(').nth(1).unwrap().split(')').next().unwrap();
    let parts: Vec<u16> = digits.split(',').map(|part| part.trim().parse().unwrap()).collect();
    assert_eq!(parts.len(), 6);

    let port = (parts[4] << 8) | parts[5];
    // the advertised port comes from the finite pool
    assert!((30080..30085).contains(&port), "port {port} not from the pool");

    SocketAddr::from((
        [parts[0] as u8, parts[1] as u8, parts[2] as u8, parts[3] as u8],
        port,
    ))
}

#[test]
fn serves_a_full_passive_session() {
    let root = scratch_dir("passive");
    fs::write(root.join("seed.txt"), b"0123456789abcdefghij").unwrap();

    let server = start_server(&root);
    let mut ftp = Ftp::connect(server.local_addr());

    // auth gate before login
    assert!(ftp.cmd("SYST").starts_with("530"));

    login(&mut ftp, &root);
    assert!(ftp.cmd("PWD").starts_with("257"));
    assert!(ftp.cmd("TYPE I").starts_with("200 Binary mode."));

    // upload
    let data_addr = pasv(&mut ftp);
    ftp.send("STOR upload.bin");
    let mut data = TcpStream::connect(data_addr).unwrap();
    data.write_all(b"stored payload").unwrap();
    drop(data);
    assert!(ftp.read_reply().starts_with("150"));
    assert!(ftp.read_reply().starts_with("226"));
    assert_eq!(fs::read(root.join("upload.bin")).unwrap(), b"stored payload");

    // append
    let data_addr = pasv(&mut ftp);
    ftp.send("APPE upload.bin");
    let mut data = TcpStream::connect(data_addr).unwrap();
    data.write_all(b" appended").unwrap();
    drop(data);
    assert!(ftp.read_reply().starts_with("150"));
    assert!(ftp.read_reply().starts_with("226"));
    assert_eq!(fs::read(root.join("upload.bin")).unwrap(), b"stored payload appended");

    // restart offset applies to exactly one download
    let data_addr = pasv(&mut ftp);
    assert!(ftp.cmd("REST 10").starts_with("250"));
    ftp.send("RETR seed.txt");
    let mut data = TcpStream::connect(data_addr).unwrap();
    let mut got = Vec::new();
    data.read_to_end(&mut got).unwrap();
    assert_eq!(got, b"abcdefghij");
    assert!(ftp.read_reply().starts_with("150"));
    assert!(ftp.read_reply().starts_with("226"));

    // the next download starts from the beginning again
    let data_addr = pasv(&mut ftp);
    ftp.send("RETR upload.bin");
    let mut data = TcpStream::connect(data_addr).unwrap();
    let mut got = Vec::new();
    data.read_to_end(&mut got).unwrap();
    assert_eq!(got, b"stored payload appended");
    assert!(ftp.read_reply().starts_with("150"));
    assert!(ftp.read_reply().starts_with("226"));

    // listing carries one formatted line per entry
    let data_addr = pasv(&mut ftp);
    ftp.send("LIST");
    let mut data = TcpStream::connect(data_addr).unwrap();
    let mut listing = String::new();
    data.read_to_string(&mut listing).unwrap();
    assert!(ftp.read_reply().starts_with("150"));
    assert!(ftp.read_reply().starts_with("226"));

    let lines: Vec<&str> = listing.lines().collect();
    assert_eq!(lines.len(), 2);
    let seed_line = lines.iter().find(|line| line.ends_with("seed.txt")).unwrap();
    let columns: Vec<&str> = seed_line.split("  ").filter(|part| !part.is_empty()).collect();
    assert_eq!(columns.len(), 7);
    assert_eq!(columns[0].len(), 10);
    assert!(columns[0].starts_with('-'));
    assert_eq!(columns[4].trim(), "20");
    assert_eq!(columns[6], "seed.txt");

    // rename, delete, directories
    assert!(ftp.cmd("RNFR seed.txt").starts_with("350"));
    assert!(ftp.cmd("RNTO renamed.txt").starts_with("250"));
    assert!(root.join("renamed.txt").exists());
    assert!(!root.join("seed.txt").exists());
    assert!(ftp.cmd("RNTO other.txt").starts_with("550"));

    assert!(ftp.cmd("DELE renamed.txt").starts_with("250"));
    assert!(!root.join("renamed.txt").exists());

    assert!(ftp.cmd("MKD subdir").starts_with("257"));
    assert!(root.join("subdir").is_dir());
    assert!(ftp.cmd("CWD subdir").starts_with("250"));
    assert!(ftp.cmd("CDUP").starts_with("250"));
    assert!(ftp.cmd("RMD subdir").starts_with("250"));
    assert!(!root.join("subdir").exists());

    assert!(ftp.cmd("QUIT").starts_with("221"));

    server.shutdown();
    fs::remove_dir_all(&root).unwrap();
}

#[test]
fn lists_over_an_active_data_channel() {
    let root = scratch_dir("active");
    fs::write(root.join("visible.txt"), b"some file data").unwrap();

    let server = start_server(&root);
    let mut ftp = Ftp::connect(server.local_addr());
    login(&mut ftp, &root);

    let data_listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = data_listener.local_addr().unwrap().port();
    let reply = ftp.cmd(&format!("PORT 127,0,0,1,{},{}", port >> 8, port & 0xFF));
    assert!(reply.starts_with("200 PORT command successful."));

    ftp.send("LIST visible.txt");
    let (mut data, _) = data_listener.accept().unwrap();
    let mut listing = String::new();
    data.read_to_string(&mut listing).unwrap();
    assert!(ftp.read_reply().starts_with("150"));
    assert!(ftp.read_reply().starts_with("226"));

    // a single file lists as exactly one line
    assert_eq!(listing.lines().count(), 1);
    assert!(listing.trim_end().ends_with("visible.txt"));

    assert!(ftp.cmd("QUIT").starts_with("221"));

    server.shutdown();
    fs::remove_dir_all(&root).unwrap();
}

#[test]
fn rejects_wrong_credentials() {
    let root = scratch_dir("badlogin");

    let server = start_server(&root);
    let mut ftp = Ftp::connect(server.local_addr());

    assert!(ftp.read_reply().starts_with("220"));
    assert!(ftp.cmd("USER user").starts_with("331"));
    assert!(ftp.cmd("PASS wrong").starts_with("530 Login incorrect."));
    assert!(ftp.cmd("LIST").starts_with("530 Please log in"));

    assert!(ftp.cmd("USER nobody").starts_with("331"));
    assert!(ftp.cmd("PASS 1234").starts_with("530 Login incorrect."));

    assert!(ftp.cmd("QUIT").starts_with("221"));

    server.shutdown();
    fs::remove_dir_all(&root).unwrap();
}
