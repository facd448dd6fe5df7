pub mod api;
pub mod app;
pub mod auth;
pub mod billing;
pub mod cancel;
pub mod cli;
pub mod commands;
pub mod config;
pub mod downloads;
pub mod http_client;
pub mod jobs;

use tracing_subscriber::EnvFilter;

pub use app::YcdApp;
pub use cli::Cli;
pub use config::ClientConfig;

/// Initialize tracing with the RUST_LOG env filter
///
/// Default: warn for dependencies, info for this crate. `--debug` raises the
/// crate to debug when RUST_LOG is unset.
pub fn init_tracing(debug: bool) {
    let default = if debug {
        "warn,ycd_client=debug"
    } else {
        "warn,ycd_client=info"
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)))
        .with_writer(std::io::stderr)
        .try_init();
}

/// Entry point behind the `ycd` binary
pub async fn run(cli: Cli) -> anyhow::Result<()> {
    init_tracing(cli.debug);

    let mut config = ClientConfig::from_env()?;
    if let Some(url) = cli.api_url.as_deref() {
        config.api_url = config::resolve_api_url(Some(url), None);
    }

    let app = YcdApp::open(config);
    commands::run(&app, cli.command).await
}
