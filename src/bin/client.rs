use std::io::{self, Write};
use std::net::{IpAddr, SocketAddr};
use std::process;
use std::thread;
use std::time::Duration;

use getopts::Options;

use rftp::config::{self, RudpConfig};
use rftp::stream::{self, Stream, Transport};
use rftp::Error;

/// Enough for a full multi-line server reply.
const REPLY_BUFFER: usize = 5000;

/// First local port offered to the server for active-mode transfers.
const RETURN_PORT: u16 = 30084;

fn prompt(text: &str) -> String {
    print!("{text}");
    let _ = io::stdout().flush();

    let mut line = String::new();
    if io::stdin().read_line(&mut line).unwrap_or(0) == 0 {
        process::exit(0);
    }
    line.trim().to_string()
}

fn send_command(stream: &mut Box<dyn Stream>, command: &str) {
    if let Err(err) = stream.send(format!("{command}\r\n").as_bytes()) {
        println!("Server command failed: {err}");
        return;
    }

    // allow the server time to respond
    thread::sleep(Duration::from_millis(200));

    match stream.receive(REPLY_BUFFER) {
        Ok(reply) if !reply.is_empty() => print!("{}", String::from_utf8_lossy(&reply)),
        Ok(_) => println!("Server did not respond to command: {command}"),
        Err(err) => println!("Server command failed: {err}"),
    }
}

/// Active-mode receiver: listens on the advertised port and prints
/// whatever the server delivers until it hangs up.
fn receive_transfer(transport: Transport, addr: SocketAddr, rudp: RudpConfig) {
    let mut listener = match stream::listen(transport, addr, &rudp) {
        Ok(listener) => listener,
        Err(err) => {
            println!("Could not open the data listener on {addr}: {err}");
            return;
        }
    };

    let mut data = loop {
        match listener.accept() {
            Ok(data) => break data,
            Err(Error::Timeout) => continue,
            Err(err) => {
                println!("Data connection failed: {err}");
                return;
            }
        }
    };

    let _ = data.set_timeout(Some(Duration::from_secs(5)));
    loop {
        match data.receive(REPLY_BUFFER) {
            Ok(chunk) if chunk.is_empty() => break,
            Ok(chunk) => print!("{}", String::from_utf8_lossy(&chunk)),
            Err(_) => break,
        }
    }

    let _ = data.close();
    let _ = listener.close();
}

fn print_help() {
    println!("ftp_client [command] [arguments]");
    println!("commands:");
    println!("  OPEN");
    println!("     opens a connection to the ftp server, asks for server ip and port");
    println!("  DIR or LIST");
    println!("     lists the files and folders in the current working directory");
    println!("  CD <path>");
    println!("     changes the current working directory");
    println!("  QUIT");
    println!("     exits this client and closes the connection to the server");
    println!("  HELP");
    println!("     shows this help screen");
    println!("anything else is passed through to the server as a raw FTP command");
}

fn main() {
    env_logger::init();

    let args: Vec<String> = std::env::args().collect();
    let mut opts = Options::new();
    opts.optopt("t", "transport", "transport protocol: tcp or rudp (default tcp)", "PROTO");
    opts.optflag("h", "help", "print this help");

    let matches = match opts.parse(&args[1..]) {
        Ok(matches) => matches,
        Err(err) => {
            eprintln!("{}: {err}", args[0]);
            process::exit(2);
        }
    };
    if matches.opt_present("help") {
        print!("{}", opts.usage(&format!("Usage: {} [options]", args[0])));
        return;
    }

    let transport = match matches.opt_str("transport").as_deref() {
        Some("rudp") => Transport::Rudp,
        _ => Transport::Tcp,
    };
    let rudp = RudpConfig::default();

    let default_host = config::default_host();
    let mut server_ip = default_host;
    let mut return_port = RETURN_PORT;
    let mut connection: Option<Box<dyn Stream>> = None;

    loop {
        let input = prompt("ftp: ");
        let lowered = input.to_ascii_lowercase();

        if lowered == "quit" {
            if let Some(mut stream) = connection.take() {
                send_command(&mut stream, "QUIT");
                let _ = stream.close();
            }
            break;
        } else if lowered == "open" {
            let host_input = prompt(&format!("Server IP [{default_host}]: "));
            server_ip = if host_input.is_empty() {
                default_host
            } else {
                match host_input.parse() {
                    Ok(ip) => ip,
                    Err(err) => {
                        println!("Bad address {host_input}: {err}");
                        continue;
                    }
                }
            };

            let port_input = prompt(&format!("Port [{}]: ", config::SERVER_PORT));
            let port = if port_input.is_empty() {
                config::SERVER_PORT
            } else {
                match port_input.parse() {
                    Ok(port) => port,
                    Err(err) => {
                        println!("Bad port {port_input}: {err}");
                        continue;
                    }
                }
            };

            match stream::connect(transport, SocketAddr::new(server_ip, port), &rudp) {
                Ok(mut stream) => {
                    if let Ok(welcome) = stream.receive(REPLY_BUFFER) {
                        print!("{}", String::from_utf8_lossy(&welcome));
                    }
                    println!("Connected to {server_ip}:{port}");

                    send_command(&mut stream, "OPTS");
                    let user = prompt(&format!("User [{}]: ", config::DEFAULT_USER));
                    let user = if user.is_empty() { config::DEFAULT_USER.to_string() } else { user };
                    send_command(&mut stream, &format!("USER {user}"));
                    let password = prompt("Password: ");
                    send_command(&mut stream, &format!("PASS {password}"));

                    connection = Some(stream);
                }
                Err(err) => println!("Could not connect: {err}"),
            }
        } else if lowered == "dir" || lowered == "list" {
            let Some(stream) = connection.as_mut() else {
                println!("Not connected, use open first");
                continue;
            };
            let IpAddr::V4(ip) = server_ip else {
                println!("Active mode needs an IPv4 server address");
                continue;
            };

            return_port += 1;
            let data_addr = SocketAddr::new(server_ip, return_port);
            let rudp = rudp.clone();
            thread::spawn(move || receive_transfer(transport, data_addr, rudp));

            let [a, b, c, d] = ip.octets();
            send_command(
                stream,
                &format!("PORT {a},{b},{c},{d},{},{}", return_port >> 8, return_port & 0xFF),
            );
            send_command(stream, "LIST");
        } else if lowered == "cd" || lowered.starts_with("cd ") {
            let Some(stream) = connection.as_mut() else {
                println!("Not connected, use open first");
                continue;
            };
            send_command(stream, &format!("CWD {}", input[2..].trim()));
        } else if lowered == "help" {
            print_help();
        } else if !input.is_empty() {
            let Some(stream) = connection.as_mut() else {
                println!("Not connected, use open first");
                continue;
            };
            send_command(stream, &input);
        }
    }
}
