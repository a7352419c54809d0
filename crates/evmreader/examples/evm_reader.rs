//! Example: run the EvmReader against a node with applications loaded from a JSON file.
//!
//! Usage: cargo run -p evmreader --example evm_reader -- --apps apps.json [--http-url URL]
//!        [--ws-url WS_URL] [--default-block latest|safe|finalized|pending]
//!
//! `apps.json` holds an array of applications, e.g.
//! `[{"name":"echo","address":"0x..","consensus_address":"0x..","input_source_address":"0x..",
//!   "input_source_deployment_block":0,"epoch_length":10,"state":"enabled"}]`.
//! Remaining settings come from `EVMREADER_*` environment variables. Ctrl-C stops the reader
//! and prints what was indexed.

use anyhow::Context;
use evmreader::{
    EvmAdapterFactory, EvmReader, InMemoryRepository, JsonRpcClient, ReaderConfig, Repository,
    Retrying,
};
use evmreader::model::Application;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("evmreader=info")),
        )
        .init();

    let mut config = ReaderConfig::from_env().map_err(anyhow::Error::msg)?;
    let args: Vec<String> = std::env::args().collect();
    let mut apps_path = String::new();
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--apps" => {
                i += 1;
                apps_path = args.get(i).cloned().unwrap_or_default();
            }
            "--http-url" => {
                i += 1;
                config.http_url = args.get(i).cloned().unwrap_or_default();
            }
            "--ws-url" => {
                i += 1;
                config.ws_url = args.get(i).cloned().unwrap_or_default();
            }
            "--default-block" => {
                i += 1;
                let value = args.get(i).cloned().unwrap_or_default();
                config.default_block = value.parse().map_err(anyhow::Error::msg)?;
            }
            _ => {}
        }
        i += 1;
    }
    if apps_path.is_empty() {
        eprintln!("Usage: evm_reader --apps FILE [--http-url URL] [--ws-url WS_URL] [--default-block POLICY]");
        std::process::exit(1);
    }
    config.validate().map_err(anyhow::Error::msg)?;

    let raw = std::fs::read_to_string(&apps_path).with_context(|| format!("read {apps_path}"))?;
    let apps: Vec<Application> = serde_json::from_str(&raw).context("parse applications")?;

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async move {
        let repository = Arc::new(InMemoryRepository::new());
        for app in apps {
            repository.insert_application(app).await;
        }

        let cancel = CancellationToken::new();
        let rpc = Arc::new(JsonRpcClient::from_config(&config)?);
        let client = Retrying::new(Arc::clone(&rpc), config.retry.clone(), cancel.clone());
        let factory = EvmAdapterFactory::new(rpc, config.retry.clone(), config.getlogs_max_range);
        let mut reader = EvmReader::new(client, Arc::clone(&repository), factory, config);
        reader.ensure_chain_id().await?;

        let shutdown = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("shutting down");
                shutdown.cancel();
            }
        });

        match reader.run(&cancel, None).await {
            Err(e) if e.is_cancelled() => {}
            Err(e) => return Err(e.into()),
            Ok(()) => {}
        }

        for app in repository.list_enabled_applications().await? {
            let epochs = repository.epochs(app.address).await;
            let inputs = repository.inputs(app.address).await;
            println!(
                "{} ({}): {} epochs, {} inputs, input cursor {}",
                app.name,
                app.address,
                epochs.len(),
                inputs.len(),
                app.last_input_check_block
            );
        }
        Ok::<(), anyhow::Error>(())
    })
}
