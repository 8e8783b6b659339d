mod admin;
pub use admin::*;

mod config;
pub use config::Config;

mod error;

mod identity;

mod replay;

mod room;
pub use room::*;

mod server;
pub use server::*;

mod session;
pub use session::*;

mod user;
pub use user::*;

use anyhow::Result;
use clap::Parser;
use std::{
    net::{Ipv4Addr, Ipv6Addr, SocketAddr},
    path::{Path, PathBuf},
};
use tokio::net::TcpListener;
use tracing::warn;
use tracing_appender::non_blocking::WorkerGuard;

pub fn init_log(file: &str) -> Result<WorkerGuard> {
    use tracing::{metadata::LevelFilter, Level};
    use tracing_log::LogTracer;
    use tracing_subscriber::{filter, fmt, prelude::*, EnvFilter};

    let log_dir = Path::new("log");
    if log_dir.exists() {
        if !log_dir.is_dir() {
            panic!("log exists and is not a folder");
        }
    } else {
        std::fs::create_dir(log_dir).expect("failed to create log folder");
    }

    LogTracer::init()?;

    let (non_blocking, guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::hourly(log_dir, file));

    let subscriber = tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(non_blocking)
                .with_filter(LevelFilter::DEBUG),
        )
        .with(
            fmt::layer()
                .with_writer(std::io::stdout)
                .with_filter(EnvFilter::from_default_env()),
        )
        .with(
            filter::Targets::new()
                .with_target("hyper", Level::INFO)
                .with_target("rustls", Level::INFO)
                .with_target("isahc", Level::INFO)
                .with_default(Level::TRACE),
        );

    tracing::subscriber::set_global_default(subscriber).expect("unable to set global subscriber");
    Ok(guard)
}

/// Command line arguments
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    #[clap(
        short,
        long,
        default_value_t = 12346,
        help = "Specify the port number to use for the server"
    )]
    port: u16,

    #[clap(
        short,
        long,
        default_value = "config.yaml",
        help = "Path to the server configuration file"
    )]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _guard = init_log("rhymux")?;

    let args = Args::parse();
    let port = args.port;
    let config = Config::load(&args.config)?;

    // Prefer a dual-stack listener so IPv4 and IPv6 clients share one
    // socket; fall back to IPv4-only if the platform won't allow it.
    let v6_listener = match TcpListener::bind(SocketAddr::new(Ipv6Addr::UNSPECIFIED.into(), port)).await {
        Ok(l) => match l.into_std() {
            Ok(socket) => {
                if let Err(err) = socket.set_only_v6(false) {
                    warn!("failed to disable IPV6_V6ONLY: {err}");
                }
                match TcpListener::from_std(socket) {
                    Ok(l) => {
                        println!("listening on [::]:{port} (IPv4 and IPv6)");
                        Some(l)
                    }
                    Err(err) => {
                        warn!("failed to convert socket back to async: {err}");
                        None
                    }
                }
            }
            Err(err) => {
                warn!("failed to get standard socket: {err}");
                None
            }
        },
        Err(err) => {
            warn!("failed to bind IPv6: {err}");
            None
        }
    };

    let listener = match v6_listener {
        Some(l) => l,
        None => {
            println!("falling back to IPv4 only");
            TcpListener::bind(SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), port)).await?
        }
    };

    let server = Server::new(listener, config);

    loop {
        if let Err(err) = server.accept().await {
            warn!("failed to accept: {err:?}");
        }
    }
}
