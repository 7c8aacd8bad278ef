use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use clap::Parser;

use boundedkv_core::{EventLoop, Executor, LRUStore, ServerConfig, ShardedEventLoop, ThreadPerConnection};

/// Bounded-by-bytes LRU cache server speaking a small text protocol over
/// TCP.
#[derive(Parser, Debug)]
#[command(name = "boundedkv-server", about = "Bounded LRU cache server")]
struct Args {
    /// Path to a TOML configuration file. Unset fields keep their
    /// defaults.
    #[arg(long)]
    config: Option<std::path::PathBuf>,

    /// Override the listen port from the config file.
    #[arg(long)]
    port: Option<u16>,

    /// Connection-handling strategy.
    #[arg(long, value_enum, default_value_t = Mode::EventLoop)]
    mode: Mode,

    /// Number of shards for `--mode sharded`.
    #[arg(long, default_value_t = 4)]
    shards: usize,
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
enum Mode {
    EventLoop,
    ThreadPerConnection,
    Sharded,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => ServerConfig::load_from_file(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => ServerConfig::default(),
    };
    if let Some(port) = args.port {
        config.listen_port = port;
    }
    config.validate().context("validating configuration")?;

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.log_level.clone()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let addr: SocketAddr = ([0, 0, 0, 0], config.listen_port).into();
    let store = Arc::new(Mutex::new(LRUStore::new(config.cache_bytes)));

    tracing::info!(?addr, mode = ?args.mode, "starting boundedkv-server");

    match args.mode {
        Mode::EventLoop => {
            let (mut event_loop, handle) =
                EventLoop::bind(addr, store).context("binding event loop listener")?;
            ctrlc_shutdown(move || handle.shutdown());
            event_loop.run().context("running event loop")?;
        }
        Mode::ThreadPerConnection => {
            let executor = Arc::new(Executor::new(
                config.low_watermark,
                config.high_watermark,
                config.max_queue,
                Duration::from_millis(config.idle_time_ms),
            ));
            let server = ThreadPerConnection::bind(
                addr,
                store,
                executor,
                config.max_connections,
                Duration::from_secs(config.read_timeout_sec),
            )
            .context("binding thread-per-connection listener")?;
            let handle = server.shutdown_handle();
            ctrlc_shutdown(move || handle.shutdown());
            server.run().context("running thread-per-connection loop")?;
        }
        Mode::Sharded => {
            let sharded = ShardedEventLoop::spawn(addr, store, args.shards)
                .context("spawning sharded event loop")?;
            let handle = sharded.shutdown_handle();
            ctrlc_shutdown(move || handle.shutdown());
            sharded.join().context("running sharded event loop")?;
        }
    }

    Ok(())
}

/// Installs a `Ctrl-C` handler that invokes `on_signal` once, so the
/// caller's blocking `run()` call is interrupted the same way external
/// operators would stop the process (`SIGINT`).
fn ctrlc_shutdown<F>(on_signal: F)
where
    F: FnOnce() + Send + 'static,
{
    let once = Mutex::new(Some(on_signal));
    let _ = ctrlc::set_handler(move || {
        if let Some(f) = once.lock().expect("ctrlc mutex poisoned").take() {
            f();
        }
    });
}
