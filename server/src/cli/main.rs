// Copyright (c) 2022-2023 The MobileCoin Foundation

//! Command line utility for the SCP81 OTA admin server

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use log::{info, warn, LevelFilter};
use tokio::sync::watch;

use scp81_ota_core::config::{KeyStoreConfig, ServerConfig};
use scp81_ota_core::keys::{FileKeyStore, KeyStore, MemoryKeyStore};
use scp81_ota_core::script::{self, LoadOptions, Script};
use scp81_ota_core::trigger::AdminTrigger;

use scp81_ota_server::{AdminServer, FixedScriptSource, RunnerPolicy, ScriptSource};

/// SCP81 OTA admin server utility
#[derive(Clone, Debug, Parser)]
struct Options {
    /// Subcommand to execute
    #[clap(subcommand)]
    cmd: Actions,

    /// Log level
    #[clap(long, default_value = "info")]
    log_level: LevelFilter,
}

#[derive(Clone, Debug, Subcommand)]
enum Actions {
    /// Run the PSK-TLS admin server
    Serve {
        /// Configuration file (defaults apply when omitted)
        #[clap(long)]
        config: Option<PathBuf>,

        /// Override the listen port
        #[clap(long)]
        port: Option<u16>,

        /// Override the key file
        #[clap(long)]
        key_file: Option<PathBuf>,

        /// Script document or directory to serve from
        #[clap(long)]
        scripts: PathBuf,

        /// Script id to run per session (first loaded script if omitted)
        #[clap(long)]
        script_id: Option<String>,

        /// Stop a run on the first non-success status word
        #[clap(long)]
        stop_on_error: bool,
    },

    /// Load and validate script documents, reporting per-file outcomes
    Scripts {
        /// Script document or directory
        path: PathBuf,
    },

    /// Render a template to a concrete script
    Render {
        /// Script document containing the template
        path: PathBuf,

        /// Template id to render
        template_id: String,

        /// Parameter bindings as NAME=VALUE
        #[clap(long = "param", value_name = "NAME=VALUE")]
        params: Vec<String>,
    },

    /// List PSK identities in a key file (never prints key material)
    Keys {
        /// Key file
        path: PathBuf,
    },

    /// Build an SMS-PP admin trigger PDU
    Trigger {
        /// Destination MSISDN
        #[clap(long)]
        destination: String,

        /// Toolkit Application Reference (3 bytes hex)
        #[clap(long, default_value = "B0FF00")]
        tar: String,

        /// Replay counter
        #[clap(long, default_value = "0")]
        counter: u32,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Options::parse();

    simplelog::SimpleLogger::init(args.log_level, simplelog::Config::default()).unwrap();

    match args.cmd {
        Actions::Serve {
            config,
            port,
            key_file,
            scripts,
            script_id,
            stop_on_error,
        } => {
            serve(config, port, key_file, scripts, script_id, stop_on_error).await?;
        }

        Actions::Scripts { path } => {
            let outcome = load_documents(&path)?;

            info!(
                "loaded {} scripts, {} templates",
                outcome.scripts.len(),
                outcome.templates.len()
            );
            for s in &outcome.scripts {
                info!("  script   {} ({} commands): {}", s.id, s.len(), s.name);
            }
            for t in &outcome.templates {
                info!(
                    "  template {} ({} parameters): {}",
                    t.id,
                    t.parameters.len(),
                    t.name
                );
            }
            if outcome.skipped > 0 {
                warn!("{} invalid items skipped", outcome.skipped);
                std::process::exit(1);
            }
        }

        Actions::Render {
            path,
            template_id,
            params,
        } => {
            let outcome = load_documents(&path)?;

            let template = outcome
                .templates
                .iter()
                .find(|t| t.id == template_id)
                .ok_or_else(|| anyhow::anyhow!("template not found: {template_id}"))?;

            let mut bindings = BTreeMap::new();
            for p in &params {
                let (name, value) = p
                    .split_once('=')
                    .ok_or_else(|| anyhow::anyhow!("parameter must be NAME=VALUE: {p}"))?;
                bindings.insert(name.to_string(), value.to_string());
            }

            let rendered = script::render(template, &bindings)?;
            for cmd in &rendered.commands {
                println!("{}", cmd.hex);
            }
        }

        Actions::Keys { path } => {
            let store = FileKeyStore::load(&path)?;
            for identity in store.list_identities() {
                println!("{identity}");
            }
        }

        Actions::Trigger {
            destination,
            tar,
            counter,
        } => {
            let mut trigger = AdminTrigger::with_tar(&tar)?;
            trigger.counter = counter;
            println!("{}", trigger.to_pdu(&destination)?);
        }
    }

    Ok(())
}

/// Load a script document or a directory of documents
fn load_documents(path: &PathBuf) -> anyhow::Result<script::LoadOutcome> {
    if path.is_dir() {
        let dir = script::load_dir(path, LoadOptions::default())?;

        for (file, (loaded, skipped)) in &dir.files {
            info!("  {}: {loaded} loaded, {skipped} skipped", file.display());
        }

        Ok(script::LoadOutcome {
            scripts: dir.scripts,
            templates: dir.templates,
            skipped: dir.files.values().map(|(_, s)| s).sum(),
        })
    } else {
        Ok(script::load_file(path, LoadOptions::default())?)
    }
}

async fn serve(
    config_path: Option<PathBuf>,
    port: Option<u16>,
    key_file: Option<PathBuf>,
    scripts_path: PathBuf,
    script_id: Option<String>,
    stop_on_error: bool,
) -> anyhow::Result<()> {
    // Configuration file first, CLI overrides on top
    let mut config = match &config_path {
        Some(path) => ServerConfig::load(path)?,
        None => ServerConfig::default(),
    };

    if let Some(port) = port {
        config.port = port;
    }
    if let Some(path) = key_file {
        config.key_store = KeyStoreConfig::File { path };
    }
    config.validate()?;

    // Key store per configuration
    let key_store: Arc<dyn KeyStore> = match &config.key_store {
        KeyStoreConfig::File { path } => Arc::new(FileKeyStore::load(path)?),
        KeyStoreConfig::Memory => {
            warn!("using an empty in-memory key store; no card can authenticate");
            Arc::new(MemoryKeyStore::new())
        }
    };

    // Script selection
    let outcome = load_documents(&scripts_path)?;
    let script: Script = match &script_id {
        Some(id) => outcome
            .scripts
            .iter()
            .find(|s| s.id == *id)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("script not found: {id}"))?,
        None => outcome
            .scripts
            .first()
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no scripts in {}", scripts_path.display()))?,
    };

    info!("serving script '{}' ({} commands)", script.id, script.len());

    let bus = scp81_ota_core::events::EventBus::default();
    bus.publish_script(scp81_ota_core::events::ScriptEvent::Loaded {
        id: script.id.clone(),
    });

    let source: Arc<dyn ScriptSource> = Arc::new(FixedScriptSource(script));
    let policy = RunnerPolicy {
        stop_on_non_success: stop_on_error,
        ..Default::default()
    };

    let server = AdminServer::bind(config, key_store, source, policy, bus).await?;

    // Flip shutdown on ctrl-c
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received");
            let _ = shutdown_tx.send(true);
        }
    });

    server.run(shutdown_rx, None).await;

    Ok(())
}
