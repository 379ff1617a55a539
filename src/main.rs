//-
// Copyright (c) 2026, Jason Lingle
//
// This file is part of xmppd.
//
// xmppd is free software: you can  redistribute it and/or modify it under the
// terms of  the GNU General Public  License as published by  the Free Software
// Foundation, either version  3 of the License, or (at  your option) any later
// version.
//
// xmppd is distributed  in the hope that  it will be useful,  but WITHOUT ANY
// WARRANTY; without  even the implied  warranty of MERCHANTABILITY  or FITNESS
// FOR  A PARTICULAR  PURPOSE.  See the  GNU General  Public  License for  more
// details.
//
// You should have received a copy of the GNU General Public License along with
// xmppd. If not, see <http://www.gnu.org/licenses/>.

use std::path::{Path, PathBuf};
use std::process;

use log::error;
use structopt::StructOpt;

use xmppd::support::config::Config;
use xmppd::xmpp::server::{self, Server};

/// A small single-domain XMPP server.
///
/// Options given on the command line override the configuration file.
#[derive(StructOpt)]
#[structopt(name = "xmppd", max_term_width = 80)]
struct Opt {
    /// Configuration file path [default: ./xmppd.conf, if present]
    #[structopt(short = "c", parse(from_os_str))]
    config: Option<PathBuf>,

    /// Domain this server is authoritative for
    #[structopt(short = "d")]
    domain: Option<String>,

    /// TCP port to listen on
    #[structopt(short = "p")]
    port: Option<u16>,

    /// Directory holding the per-user data trees
    #[structopt(short = "D")]
    data_dir: Option<String>,

    /// Log file path; empty logs to stderr
    #[structopt(short = "l")]
    log_file: Option<String>,

    /// Log level: DEBUG, INFO, WARN, or ERROR
    #[structopt(short = "L")]
    log_level: Option<String>,
}

fn main() {
    let opt = Opt::from_args();

    let mut cfg = Config::default();
    match &opt.config {
        Some(path) => {
            if let Err(e) = cfg.load_file(path) {
                eprintln!("Error reading '{}': {}", path.display(), e);
                process::exit(1);
            }
        },
        // The default config file is optional.
        None => {
            let _ = cfg.load_file(Path::new("./xmppd.conf"));
        },
    }

    if let Some(domain) = opt.domain {
        cfg.domain = domain;
    }
    if let Some(port) = opt.port {
        cfg.port = port;
    }
    if let Some(data_dir) = opt.data_dir {
        cfg.data_dir = data_dir;
    }
    if let Some(log_file) = opt.log_file {
        cfg.log_file = log_file;
    }
    if let Some(log_level) = opt.log_level {
        cfg.log_level = log_level;
    }

    init_logging(&cfg);
    install_signal_handlers();

    let addr = format!("{}:{}", cfg.bind_address, cfg.port);
    let srv = Server::new(&cfg.domain, &cfg.data_dir, &addr);
    let listener = match srv.bind() {
        Ok(listener) => listener,
        Err(e) => {
            error!("unable to listen on {}: {}", addr, e);
            eprintln!("Unable to listen on {}: {}", addr, e);
            process::exit(1);
        },
    };

    srv.run(listener);
}

fn init_logging(cfg: &Config) {
    use log4rs::append::console::{ConsoleAppender, Target};
    use log4rs::append::file::FileAppender;
    use log4rs::append::Append;
    use log4rs::config::{Appender, Root};
    use log4rs::encode::pattern::PatternEncoder;

    let level = match cfg.log_level.to_ascii_uppercase().as_str() {
        "DEBUG" => log::LevelFilter::Debug,
        "WARN" => log::LevelFilter::Warn,
        "ERROR" => log::LevelFilter::Error,
        _ => log::LevelFilter::Info,
    };

    let pattern = "{d(%Y-%m-%d %H:%M:%S%.3f)} [{l}][{t}] {m}{n}";
    let stderr = || {
        Box::new(
            ConsoleAppender::builder()
                .target(Target::Stderr)
                .encoder(Box::new(PatternEncoder::new(pattern)))
                .build(),
        )
    };

    let appender: Box<dyn Append> = if cfg.log_file.is_empty() {
        stderr()
    } else {
        match FileAppender::builder()
            .encoder(Box::new(PatternEncoder::new(pattern)))
            .build(&cfg.log_file)
        {
            Ok(file) => Box::new(file),
            Err(e) => {
                eprintln!(
                    "Could not open log file '{}', using stderr: {}",
                    cfg.log_file, e
                );
                stderr()
            },
        }
    };

    let log_config = log4rs::config::Config::builder()
        .appender(Appender::builder().build("main", appender))
        .build(Root::builder().appender("main").build(level))
        .unwrap();
    log4rs::init_config(log_config).unwrap();
}

/// SIGINT and SIGTERM flag the accept loop to stop. The handlers are
/// installed without SA_RESTART so a blocked `accept` returns EINTR.
fn install_signal_handlers() {
    use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};

    let action = SigAction::new(
        SigHandler::Handler(handle_shutdown_signal),
        SaFlags::empty(),
        SigSet::empty(),
    );
    unsafe {
        let _ = signal::sigaction(Signal::SIGINT, &action);
        let _ = signal::sigaction(Signal::SIGTERM, &action);
    }
}

extern "C" fn handle_shutdown_signal(_signo: nix::libc::c_int) {
    server::request_shutdown();
}
