use clap::Parser;
use ycd_client::{config, Cli};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env before parsing so env-backed flags see it
    config::load_dotenv();
    let cli = Cli::parse();
    ycd_client::run(cli).await
}
