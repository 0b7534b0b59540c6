mod routes;

use acp_core::dial::LocalDialer;
use acp_core::ports::ProcNetPortSource;
use acp_core::{Registry, RegistryConfig};
use clap::Parser;
use std::{
    fs::{File, OpenOptions},
    io,
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::Duration,
};
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_HUB_ADDR: &str = "127.0.0.1:7480";
const LOG_FILE_NAME: &str = "acp-hub.log";

#[derive(Parser, Debug)]
#[command(name = "acp-hub", about = "Agent control plane hub")]
struct Args {
    #[arg(long, env = "ACP_HUB_ADDR", default_value = DEFAULT_HUB_ADDR)]
    addr: SocketAddr,
    /// Forces debug logging regardless of `ACP_LOG_LEVEL`.
    #[arg(long, env = "ACP_HUB_DEBUG")]
    debug: bool,
    #[arg(long, env = "ACP_LOG_LEVEL", default_value = "info")]
    log_level: String,
    /// Directory for `acp-hub.log`; stdout only when unset.
    #[arg(long, env = "ACP_LOG_DIR")]
    log_dir: Option<PathBuf>,
    #[arg(long, default_value_t = 1000, value_parser = clap::value_parser!(u64).range(1..))]
    debounce_ms: u64,
    #[arg(long, default_value_t = 64, value_parser = clap::value_parser!(u64).range(1..))]
    watcher_capacity: u64,
    #[arg(long, env = "ACP_TROUBLESHOOTING_URL")]
    troubleshooting_url: Option<String>,
    /// Seconds between pings on agent channels.
    #[arg(long, default_value_t = 10, value_parser = clap::value_parser!(u64).range(1..))]
    ping_interval: u64,
    /// Seconds a single websocket write may take.
    #[arg(long, default_value_t = 2, value_parser = clap::value_parser!(u64).range(1..))]
    write_timeout: u64,
}

impl Args {
    fn registry_config(&self) -> RegistryConfig {
        let debounce_window = Duration::from_millis(self.debounce_ms);
        let defaults = RegistryConfig::default();
        RegistryConfig {
            debounce_window,
            debounce_max_delay: defaults.debounce_max_delay.max(debounce_window),
            watcher_capacity: usize::try_from(self.watcher_capacity).unwrap_or(usize::MAX),
            default_troubleshooting_url: self
                .troubleshooting_url
                .as_deref()
                .map(str::trim)
                .filter(|url| !url.is_empty())
                .map_or(defaults.default_troubleshooting_url.clone(), str::to_string),
            ..defaults
        }
    }

    fn filter_directive(&self) -> &str {
        if self.debug {
            "debug"
        } else {
            &self.log_level
        }
    }

    fn hub_state(&self, registry: Arc<Registry>) -> routes::HubState {
        routes::HubState {
            registry,
            ping_interval: Duration::from_secs(self.ping_interval),
            write_timeout: Duration::from_secs(self.write_timeout),
        }
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    if let Err(err) = init_logging(&args) {
        eprintln!("log_init_error: {err}");
    }

    let dialer = LocalDialer::new(Arc::new(ProcNetPortSource::default()));
    let registry = Registry::new(args.registry_config(), Arc::new(dialer));
    let app = routes::router(args.hub_state(registry));

    let listener = match tokio::net::TcpListener::bind(args.addr).await {
        Ok(value) => value,
        Err(err) => {
            error!(event = "hub_bind_failed", addr = %args.addr, error = %err);
            return;
        }
    };

    info!(event = "hub_start", addr = %args.addr, debug = args.debug);

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
        info!(event = "hub_shutdown");
    };

    if let Err(err) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
    {
        error!(event = "hub_error", error = %err);
    }
}

/// Stdout plus, when a log directory is configured, an ANSI-free copy in
/// `acp-hub.log`. `RUST_LOG` overrides the flag-derived filter.
fn init_logging(args: &Args) -> io::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(args.filter_directive()))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let file_layer = match args.log_dir.as_deref() {
        Some(dir) => Some(
            fmt::layer()
                .with_ansi(false)
                .with_writer(Mutex::new(open_log_file(dir)?)),
        ),
        None => None,
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .with(file_layer)
        .try_init()
        .map_err(|err| io::Error::new(io::ErrorKind::Other, err.to_string()))
}

fn open_log_file(dir: &Path) -> io::Result<File> {
    std::fs::create_dir_all(dir)?;
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join(LOG_FILE_NAME))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(extra: &[&str]) -> Args {
        let argv = ["acp-hub", "--addr", DEFAULT_HUB_ADDR, "--log-level", "info"]
            .iter()
            .chain(extra)
            .copied();
        Args::try_parse_from(argv).expect("args")
    }

    #[test]
    fn registry_config_carries_flags() {
        let args = parse(&["--debounce-ms", "250", "--watcher-capacity", "8"]);
        let registry = args.registry_config();
        assert_eq!(registry.debounce_window, Duration::from_millis(250));
        assert_eq!(registry.debounce_max_delay, RegistryConfig::default().debounce_max_delay);
        assert_eq!(registry.watcher_capacity, 8);
    }

    #[test]
    fn long_debounce_raises_max_delay() {
        let args = parse(&[
            "--debounce-ms",
            "10000",
            "--troubleshooting-url",
            "https://docs.example.com/agents",
        ]);
        let registry = args.registry_config();
        assert_eq!(registry.debounce_max_delay, Duration::from_secs(10));
        assert_eq!(
            registry.default_troubleshooting_url,
            "https://docs.example.com/agents"
        );
    }

    #[test]
    fn blank_troubleshooting_url_keeps_default() {
        let args = parse(&["--troubleshooting-url", "  "]);
        assert_eq!(
            args.registry_config().default_troubleshooting_url,
            acp_core::config::DEFAULT_TROUBLESHOOTING_URL
        );
    }

    #[test]
    fn zero_intervals_are_rejected() {
        for flag in ["--debounce-ms", "--watcher-capacity", "--ping-interval", "--write-timeout"] {
            let argv = ["acp-hub", "--addr", DEFAULT_HUB_ADDR, flag, "0"];
            assert!(Args::try_parse_from(argv).is_err(), "{flag} accepted 0");
        }
    }

    #[test]
    fn debug_flag_overrides_log_level() {
        assert_eq!(parse(&["--log-level", "warn"]).filter_directive(), "warn");
        assert_eq!(
            parse(&["--log-level", "warn", "--debug"]).filter_directive(),
            "debug"
        );
    }

    #[test]
    fn log_file_lands_in_the_configured_dir() {
        let dir = std::env::temp_dir().join(format!("acp-hub-logs-{}", uuid::Uuid::new_v4()));
        open_log_file(&dir).expect("open log file");
        assert!(dir.join(LOG_FILE_NAME).is_file());
        std::fs::remove_dir_all(&dir).expect("cleanup");
    }
}
