#[macro_use]
extern crate tracing;

use std::{path::PathBuf, process};

use anyhow::Context;
use structopt::StructOpt;
use tokio::signal::ctrl_c;
use tracing_futures::Instrument;

use fl_rounds::{
    aggregator::{Aggregator, FedAvg},
    logging,
    message::Payload,
    server::RoundServer,
    settings::{CoordinatorSettings, RoundSettings, SiloSettings},
    topology::is_edge_server,
};

#[derive(Debug, StructOpt)]
#[structopt(name = "coordinator", about = "Federated learning coordinator")]
struct Opt {
    /// Path of the configuration file
    #[structopt(short, parse(from_os_str))]
    config_path: PathBuf,
}

#[tokio::main]
async fn main() {
    let opt = Opt::from_args();

    let settings = CoordinatorSettings::new(&opt.config_path).unwrap_or_else(|err| {
        eprintln!("Problem parsing configuration file: {}", err);
        process::exit(1);
    });

    let CoordinatorSettings {
        server,
        rounds,
        silos,
        log,
    } = settings;
    if let Err(err) = logging::configure(log) {
        eprintln!("Failed to set up logging: {}", err);
        process::exit(1);
    }

    let address = format!("{}:{}", server.address, server.port);
    tokio::select! {
        result = run(address, rounds, silos).instrument(trace_span!("coordinator")) => {
            match result {
                Ok(()) => info!("shutting down: all rounds completed"),
                Err(e) => {
                    error!("shutting down: {:#}", e);
                    process::exit(1);
                }
            }
        }
        result = ctrl_c() => {
            match result {
                Ok(()) => info!("shutting down: received SIGINT"),
                Err(e) => error!("shutting down: error while waiting for SIGINT: {}", e),
            }
        }
    }
}

async fn run(
    address: String,
    rounds: RoundSettings,
    silos: Option<SiloSettings>,
) -> anyhow::Result<()> {
    let mut server = RoundServer::bind(address.as_str(), rounds.per_round).await?;
    if let Some(SiloSettings {
        total_clients,
        total_silos,
    }) = silos
    {
        server = server.admit(move |id| is_edge_server(id, total_clients, total_silos));
    }
    if let Some(timeout) = rounds.heartbeat_timeout() {
        server = server.with_heartbeat_timeout(timeout);
    }

    let mut aggregator = FedAvg::new();
    let mut global = Payload::Single(vec![0.0; rounds.model_length]);
    for round in 0..rounds.count {
        let updates = server
            .run_round(round, &global)
            .await
            .with_context(|| format!("round {} failed", round))?;
        for update in updates {
            aggregator.add_local_result(update)?;
        }
        global = aggregator.aggregate()?;
        info!("round {} completed", round);
    }
    Ok(())
}
