// Copyright (c) 2022-2023 The MobileCoin Foundation

//! Standalone card simulator: connect to an admin server and answer
//! every command with `9000`

use clap::Parser;
use log::{info, LevelFilter};

use scp81_ota_sim::{always_ok, CardClient, CardOptions};

/// Simulated card for SCP81 admin server testing
#[derive(Clone, Debug, Parser)]
struct Options {
    /// Server address (host:port)
    #[clap(long, default_value = "127.0.0.1:8443")]
    server: String,

    /// PSK identity to present
    #[clap(long, default_value = "card_001")]
    identity: String,

    /// Hex-encoded PSK key
    #[clap(long)]
    key: String,

    /// Admin path to POST to
    #[clap(long, default_value = "/admin")]
    admin_path: String,

    /// Log level
    #[clap(long, default_value = "info")]
    log_level: LevelFilter,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Options::parse();

    simplelog::SimpleLogger::init(args.log_level, simplelog::Config::default()).unwrap();

    let key = hex::decode(&args.key)?;
    let options = CardOptions::new(&args.identity, key).with_admin_path(&args.admin_path);

    let mut client = CardClient::connect(&args.server, options).await?;
    info!("connected to {} as '{}'", args.server, args.identity);

    let stats = client.run_dialog(always_ok).await?;
    info!(
        "session finished: {} commands executed, {} responses sent",
        stats.commands, stats.responses
    );

    Ok(())
}
