use clap::Parser;
use tracing_subscriber::EnvFilter;

use study_chat_server::cli::Args;
use study_chat_server::web;

const DEFAULT_LOG_FILTER: &str = "info,study_chat_server=debug";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // A missing .env is normal in deployment.
    let dotenv_loaded = dotenv::dotenv().is_ok();
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    tracing::info!(dotenv = dotenv_loaded, version = env!("CARGO_PKG_VERSION"), "starting study-chat-server");

    web::serve(&args).await
}
