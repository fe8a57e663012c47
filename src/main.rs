use anyhow::Result;
use clap::Parser;
use log::info;

use modbus_register_server::cli::{commands, Cli};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level)).init();

    info!("🖥️  Modbus register server v{}", modbus_register_server::VERSION);
    commands::handle_command(cli.command).await
}
