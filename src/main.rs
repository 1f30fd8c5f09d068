#![warn(clippy::all)]

mod blocklist;
mod cache;
mod chunked;
mod classify;
mod console;
mod error;
mod response;
mod session;
mod state;
mod tunnel;

use crate::blocklist::Blocklist;
use crate::error::{is_expected_error, ProxyError};
use crate::session::{Session, SessionConfig};
use crate::state::{unix_now, ProxyState, RuntimeFlags};
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::io::BufReader;
use tokio::net::TcpListener;
use tracing::{debug, error, info, trace};

// ============================================================================
// CLI ARGUMENTS
// ============================================================================

#[derive(Parser, Debug, Clone)]
#[command(author, version, about)]
struct Args {
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    #[arg(long, default_value_t = 4000)]
    port: u16,

    /// JSON file holding the blocked hosts, rewritten on every change
    #[arg(long, default_value = "blockList.json")]
    blocklist: PathBuf,

    #[arg(long, default_value_t = 10)]
    timeout_connect: u64,

    /// Upper bound in seconds on a spliced tunnel, 0 for none
    #[arg(long, default_value_t = 0)]
    timeout_idle: u64,

    #[arg(long, default_value_t = 60)]
    stats_interval: u64,

    /// Start with cache consultation disabled
    #[arg(long)]
    no_cache: bool,

    /// Start with hit/miss latency logging enabled
    #[arg(long)]
    timing: bool,

    /// Do not read operator commands from stdin
    #[arg(long)]
    no_console: bool,

    #[arg(long, short = 'q')]
    quiet: bool,

    #[arg(long, short = 'v')]
    verbose: bool,

    #[arg(long, default_value = "info")]
    log_level: String,
}

fn seconds(value: u64) -> Option<Duration> {
    if value > 0 {
        Some(Duration::from_secs(value))
    } else {
        None
    }
}

// ============================================================================
// MAIN
// ============================================================================

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let log_level = if args.quiet {
        "error"
    } else if args.verbose {
        "debug"
    } else {
        &args.log_level
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with_target(false)
        .compact()
        .init();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(num_cpus::get())
        .thread_stack_size(2 * 1024 * 1024)
        .enable_all()
        .build()?;

    // A fatal listener error ends the process with a non-zero status so the
    // supervisor can restart it.
    runtime.block_on(run(args))
}

async fn run(args: Args) -> anyhow::Result<()> {
    let blocklist = Blocklist::load(&args.blocklist)?;
    let flags = RuntimeFlags::new(!args.no_cache, args.verbose, args.timing);
    let state = Arc::new(ProxyState::new(blocklist, flags));

    if args.stats_interval > 0 {
        let state = state.clone();
        let interval = args.stats_interval;
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(Duration::from_secs(interval));
            loop {
                timer.tick().await;
                let purged = state.cache.purge_expired(unix_now());
                if purged > 0 {
                    debug!("Purged {} expired cache entries", purged);
                }
                state.stats.print(&state.cache);
            }
        });
    }

    if !args.no_console {
        let state = state.clone();
        tokio::spawn(async move {
            let stdin = BufReader::new(tokio::io::stdin());
            if let Err(e) = console::run(state, stdin).await {
                error!("Console stopped: {}", e);
            }
        });
    }

    let addr: SocketAddr = format!("{}:{}", args.host, args.port).parse()?;
    let listener = bind(addr, args.port)?;

    info!(
        "Proxy listening on {} with {} blocked hosts from {:?}",
        addr,
        state.blocklist.len(),
        state.blocklist.path()
    );

    let config = SessionConfig {
        connect_timeout: seconds(args.timeout_connect),
        idle_timeout: seconds(args.timeout_idle),
    };

    loop {
        let accepted = tokio::select! {
            accepted = listener.accept() => accepted,
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                return Ok(());
            }
        };

        let (client_stream, client_addr) = match accepted {
            Ok(conn) => conn,
            // The peer gave up before we got to it.
            Err(e) if is_expected_error(&e) => continue,
            Err(e) => {
                error!("Listener failed: {}", e);
                return Err(e.into());
            }
        };

        state.stats.total.fetch_add(1, Ordering::Relaxed);
        state.stats.active.fetch_add(1, Ordering::Relaxed);

        let session = Session::new(state.clone(), config.clone(), client_addr);
        let state = state.clone();

        tokio::spawn(async move {
            match session.run(client_stream).await {
                Ok(()) | Err(ProxyError::Blocked(_)) => {}
                Err(ProxyError::Io(e)) if is_expected_error(&e) => {
                    trace!("Client {} disconnected: {}", client_addr, e);
                }
                Err(e) => {
                    debug!("Connection error from {}: {}", client_addr, e);
                    state.stats.failed.fetch_add(1, Ordering::Relaxed);
                }
            }

            state.stats.active.fetch_sub(1, Ordering::Relaxed);
        });
    }
}

fn bind(addr: SocketAddr, port: u16) -> anyhow::Result<TcpListener> {
    use socket2::{Domain, Protocol, Socket, Type};

    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;

    if let Err(e) = socket.bind(&addr.into()) {
        if e.kind() == ErrorKind::AddrInUse {
            error!("Port {} already in use; pick another with --port", port);
        }
        return Err(e.into());
    }

    socket.listen(1024)?;
    Ok(TcpListener::from_std(socket.into())?)
}

// ============================================================================
// TESTS
// ============================================================================
