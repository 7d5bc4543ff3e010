//! wisp: ephemeral in-memory chat hub.
//!
//! Everything lives in process memory and dies with the process; that is
//! the point.  Configuration comes from CLI arguments or environment
//! variables, CLI taking precedence.

use std::env;
use std::net::SocketAddr;

use clap::Parser;

use wisp::hub::{HubConfig, HubState};
use wisp::server::app;
use wisp::{logging, tlog};

/// Ephemeral chat hub: presence, conversations, and per-device fan-out
/// over WebSockets.  Nothing is ever written to durable storage.
#[derive(Parser, Debug)]
#[command(name = "wisp", version, about)]
struct Cli {
    /// Bind address [env: WISP_BIND] [default: 127.0.0.1:4000]
    #[arg(long, short = 'b')]
    bind: Option<String>,

    /// Messages retained in an archived conversation [env: WISP_ARCHIVE_TAIL]
    #[arg(long)]
    archive_tail: Option<usize>,

    /// Maximum message content size in bytes [env: WISP_MAX_CONTENT_BYTES]
    #[arg(long)]
    max_content_bytes: Option<usize>,
}

struct Config {
    bind_addr: String,
    hub: HubConfig,
}

impl Config {
    fn from_cli_and_env(cli: Cli) -> Self {
        let defaults = HubConfig::default();
        let bind_addr = cli
            .bind
            .or_else(|| env::var("WISP_BIND").ok())
            .unwrap_or_else(|| "127.0.0.1:4000".to_string());
        let archive_tail = cli
            .archive_tail
            .or_else(|| env_usize("WISP_ARCHIVE_TAIL"))
            .unwrap_or(defaults.archive_tail);
        let max_content_bytes = cli
            .max_content_bytes
            .or_else(|| env_usize("WISP_MAX_CONTENT_BYTES"))
            .unwrap_or(defaults.max_content_bytes);

        Self {
            bind_addr,
            hub: HubConfig {
                archive_tail,
                max_content_bytes,
                ..defaults
            },
        }
    }
}

fn env_usize(key: &str) -> Option<usize> {
    env::var(key).ok().and_then(|value| value.parse().ok())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let config = Config::from_cli_and_env(cli);

    logging::init();
    tlog!("wisp hub starting");
    tlog!("  bind: {}", config.bind_addr);
    tlog!("  archive tail: {} message(s)", config.hub.archive_tail);
    tlog!("  max content: {} bytes", config.hub.max_content_bytes);

    let state = HubState::new(config.hub);
    let router = app(state).into_make_service_with_connect_info::<SocketAddr>();

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .unwrap_or_else(|error| panic!("failed to bind {}: {error}", config.bind_addr));
    tlog!("wisp hub listening on {}", config.bind_addr);

    axum::serve(listener, router)
        .await
        .unwrap_or_else(|error| panic!("server error: {error}"));
}
