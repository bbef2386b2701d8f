#[macro_use]
extern crate tracing;

use std::{path::PathBuf, process};

use anyhow::Context;
use structopt::StructOpt;

use fl_rounds::{
    aggregator::FedAvg,
    client::Client,
    edge::EdgeRelay,
    logging,
    settings::Settings,
    simulated::SimulatedLearner,
};

#[derive(Debug, StructOpt)]
#[structopt(name = "client", about = "Federated learning client or edge server")]
struct Opt {
    /// Path of the configuration file
    #[structopt(short, parse(from_os_str))]
    config_path: PathBuf,
}

#[tokio::main]
async fn main() {
    let opt = Opt::from_args();

    let settings = Settings::new(&opt.config_path).unwrap_or_else(|err| {
        eprintln!("Problem parsing configuration file: {}", err);
        process::exit(1);
    });

    if let Err(err) = _main(settings).await {
        error!("{:#}", err);
        process::exit(1);
    }
}

/// Run a single client session. A failed session is not retried here: the
/// process exits with an error and whoever supervises it decides on a restart.
async fn _main(mut settings: Settings) -> anyhow::Result<()> {
    let log = std::mem::take(&mut settings.log);
    logging::configure(log).context("failed to set up logging")?;

    if settings.is_edge_server() {
        let relay = EdgeRelay::bind(&settings, FedAvg::new())
            .await
            .context("failed to start the edge server")?;
        Client::new(&settings, relay)?.run().await?;
    } else {
        let learner = SimulatedLearner::new(settings.client_id(), &settings.simulation);
        Client::new(&settings, learner)?.run().await?;
    }
    Ok(())
}
