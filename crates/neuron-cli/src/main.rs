// SPDX-License-Identifier: PolyForm-Shield-1.0

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

#[derive(Parser)]
#[command(name = "neuron", version, about = "GPU worker deployment supervisor")]
struct Cli {
    /// optional path to a config file (applies to all subcommands)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// debug logging for neuron crates unless RUST_LOG is set
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// reconcile, watch for crashes and serve the management api
    Serve(ServeOpts),

    /// repair drift between stored records and workers, then exit
    Reconcile,

    /// print per-GPU memory use and model placement
    Gpus,

    /// print every known model record
    List,

    /// print the model catalog, flagging models already downloaded
    Catalog,

    /// print models found in the local Hugging Face cache
    Cached,
}

#[derive(Parser, Debug)]
struct ServeOpts {
    /// address for the management api (overrides server.listen)
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// optional node identity / label for operator
    #[arg(long)]
    node_id: Option<String>,
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    if cli.verbose {
        util::logging::init_tracing_with("neuron=debug,model_runtime=debug,info");
    } else {
        util::logging::init_tracing();
    }

    let mut config = config::load(cli.config.as_deref()).context("failed to load configuration")?;
    info!("starting neuron: {:?}", cli.command);

    match cli.command {
        Commands::Serve(opts) => {
            if let Some(listen) = opts.listen {
                config.server.listen = listen;
            }
            if opts.node_id.is_some() {
                config.node_id = opts.node_id;
            }
            neuron::run(config).await?;
        }
        Commands::Reconcile => {
            let supervisor = neuron::build(&config).await?;
            let report = supervisor.reconciler().run().await;
            print_json(&report)?;
        }
        Commands::Gpus => {
            let supervisor = neuron::build(&config).await?;
            print_json(&supervisor.gpu_report().await?)?;
        }
        Commands::List => {
            let supervisor = neuron::build(&config).await?;
            print_json(&supervisor.list_views().await?)?;
        }
        Commands::Catalog => {
            let supervisor = neuron::build(&config).await?;
            print_json(&supervisor.available_models().await)?;
        }
        Commands::Cached => {
            let supervisor = neuron::build(&config).await?;
            print_json(&supervisor.cached_models().await)?;
        }
    }

    Ok(())
}
