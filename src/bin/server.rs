use std::io::stdin;
use std::path::PathBuf;
use std::process;
use std::time::Duration;

use getopts::Options;
use log::error;

use rftp::stream::Transport;
use rftp::{Config, FtpServer};

fn usage(program: &str, opts: &Options) -> ! {
    print!("{}", opts.usage(&format!("Usage: {program} [options]")));
    process::exit(0);
}

fn parse_config(program: &str, matches: &getopts::Matches) -> Config {
    let mut config = Config::default();

    if let Some(transport) = matches.opt_str("transport") {
        config.transport = match transport.to_ascii_lowercase().as_str() {
            "tcp" => Transport::Tcp,
            "rudp" => Transport::Rudp,
            other => {
                eprintln!("{program}: unknown transport \"{other}\", use tcp or rudp");
                process::exit(2);
            }
        };
    }
    if let Some(host) = matches.opt_str("host") {
        config.host = match host.parse() {
            Ok(host) => host,
            Err(err) => {
                eprintln!("{program}: bad host \"{host}\": {err}");
                process::exit(2);
            }
        };
    }

    let numeric = |name: &str| {
        matches.opt_str(name).map(|raw| match raw.parse::<u64>() {
            Ok(value) => value,
            Err(err) => {
                eprintln!("{program}: bad value for --{name} \"{raw}\": {err}");
                process::exit(2);
            }
        })
    };

    if let Some(port) = numeric("port") {
        config.port = port as u16;
    }
    if let Some(user) = matches.opt_str("user") {
        config.user = user;
    }
    if let Some(password) = matches.opt_str("password") {
        config.password = password;
    }
    if matches.opt_present("no-delete") {
        config.allow_delete = false;
    }
    if let Some(root) = matches.opt_str("root") {
        config.root = PathBuf::from(root);
    }
    if let Some(mtu) = numeric("mtu") {
        config.rudp.mtu = mtu as usize;
    }
    if let Some(window) = numeric("max-window") {
        config.rudp.max_window = window as usize;
    }
    if let Some(sleep) = numeric("retry-sleep-ms") {
        config.rudp.retry_sleep = Duration::from_millis(sleep);
    }
    if let Some(retries) = numeric("max-retries") {
        config.rudp.max_retries = retries as u32;
    }

    config
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args: Vec<String> = std::env::args().collect();
    let program = args[0].clone();

    let mut opts = Options::new();
    opts.optopt("t", "transport", "transport protocol: tcp or rudp (default tcp)", "PROTO");
    opts.optopt("H", "host", "bind address (default: the local hostname)", "ADDR");
    opts.optopt("p", "port", "command listener port (default 20383)", "PORT");
    opts.optopt("u", "user", "login user name (default user)", "NAME");
    opts.optopt("P", "password", "login password (default 1234)", "PASS");
    opts.optflag("", "no-delete", "reject DELE and RMD");
    opts.optopt("r", "root", "initial working directory served to clients (default /)", "DIR");
    opts.optopt("", "mtu", "RUDP datagram cap in bytes (default 1024)", "BYTES");
    opts.optopt("", "max-window", "RUDP maximum in-flight packets (default 10)", "N");
    opts.optopt("", "retry-sleep-ms", "RUDP send-retry sleep (default 50)", "MS");
    opts.optopt("", "max-retries", "RUDP send-retry bound (default 600)", "N");
    opts.optflag("h", "help", "print this help");

    let matches = match opts.parse(&args[1..]) {
        Ok(matches) => matches,
        Err(err) => {
            eprintln!("{program}: {err}");
            process::exit(2);
        }
    };
    if matches.opt_present("help") {
        usage(&program, &opts);
    }

    let config = parse_config(&program, &matches);

    let server = match FtpServer::start(config) {
        Ok(server) => server,
        Err(err) => {
            error!("cannot launch server: {err}");
            process::exit(1);
        }
    };

    println!("press q and Enter or Ctrl+C to stop the ftp server");
    let mut line = String::new();
    loop {
        line.clear();
        // a closed stdin also brings the server down
        if stdin().read_line(&mut line).unwrap_or(0) == 0 {
            break;
        }
        if line.trim().eq_ignore_ascii_case("q") {
            break;
        }
    }

    server.shutdown();
}
