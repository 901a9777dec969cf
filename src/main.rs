mod cli;
mod config;
mod downloader;
mod errors;
mod library;
mod processing;
mod retry;
mod search;
mod server;
mod spotify;
mod utils;

use clap::Parser;
use log::error;

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = cli::Cli::parse();

    let config = match config::AppConfig::load() {
        Ok(config) => config,
        Err(e) => {
            error!("[CONFIG] Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    match cli::run(cli, config).await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    }
}
