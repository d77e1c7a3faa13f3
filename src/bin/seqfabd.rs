//! `seqfabd`: the host process wrapping `Sequencer` in a real TCP
//! listener. `structopt` for flags, `env_logger` for logging, `ctrlc` for
//! graceful shutdown, all gated behind the `cli` feature.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::{error, info};
use structopt::StructOpt;

use seqfab::config::Config;
use seqfab::sequencer::Sequencer;
use seqfab::transport::{Listener, TcpListenerChannel};

#[derive(StructOpt, Debug)]
#[structopt(name = "seqfabd", about = "Deterministic pub/sub sequencing fabric daemon")]
struct Opt {
    /// Path to a TOML config file.
    #[structopt(long, parse(from_os_str))]
    config: Option<std::path::PathBuf>,

    /// Overrides `listen_addr` from the config file.
    #[structopt(long)]
    listen: Option<String>,
}

fn main() {
    let opt = Opt::from_args();

    let mut config = match &opt.config {
        Some(path) => match Config::from_file(path) {
            Ok(c) => c,
            Err(e) => {
                eprintln!("failed to load config {:?}: {}", path, e);
                std::process::exit(1);
            }
        },
        None => Config::default(),
    };
    if let Some(listen) = opt.listen {
        config.listen_addr = listen;
    }

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&config.log_level))
        .init();

    let addr: SocketAddr = match config.listen_addr.parse() {
        Ok(a) => a,
        Err(e) => {
            error!("invalid listen_addr {:?}: {}", config.listen_addr, e);
            std::process::exit(1);
        }
    };

    let mut listener = match TcpListenerChannel::bind(addr) {
        Ok(l) => l,
        Err(e) => {
            error!("failed to bind {}: {}", addr, e);
            std::process::exit(1);
        }
    };
    info!("seqfabd listening on {}", addr);

    let running = Arc::new(AtomicBool::new(true));
    {
        let running = running.clone();
        if let Err(e) = ctrlc::set_handler(move || {
            info!("shutdown requested");
            running.store(false, Ordering::SeqCst);
        }) {
            error!("failed to install signal handler: {}", e);
        }
    }

    let mut sequencer = Sequencer::new();

    while running.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok(Some(channel)) => {
                let idx = sequencer.add_session(channel);
                info!("accepted connection, session slot {}", idx);
            }
            Ok(None) => {}
            Err(e) => error!("accept error: {}", e),
        }

        if let Err(e) = sequencer.handle_io() {
            error!("handle_io error: {}", e);
        }

        if sequencer.session_count() == 0 {
            thread::sleep(Duration::from_millis(5));
        }
    }

    info!("seqfabd shutting down, {} session(s) open", sequencer.session_count());
}
