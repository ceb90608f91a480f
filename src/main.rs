use anyhow::Result;
use clap::Parser;
use hotdeploy::config::Configuration;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
pub struct Opt {
    /// Configuration files, later files override earlier ones
    #[clap(short, long, value_parser)]
    pub config: Vec<std::path::PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Setup the logger
    tracing_subscriber::fmt()
        .with_target(true)
        .with_thread_ids(true)
        .with_level(true)
        .with_ansi(false)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let options = Opt::parse();

    let config = Configuration::config(Configuration::figment(options.config))?;

    hotdeploy::start(config).await
}
