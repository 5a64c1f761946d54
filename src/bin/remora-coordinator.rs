use std::sync::Arc;

use anyhow::{bail, Error};

use remora::api;
use remora::config::CoordinatorConfig;
use remora::coordinator::Coordinator;

#[tokio::main]
async fn main() {
    env_logger::init();
    if let Err(err) = run().await {
        eprintln!("Error: {}", err);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Error> {
    let mut args = std::env::args().skip(1);
    let config_path = match args.next() {
        Some(path) => path,
        None => bail!("usage: remora-coordinator <config.json>"),
    };
    let config = CoordinatorConfig::load(&config_path)?;
    let addr = config
        .bind_address
        .parse()
        .map_err(|err| anyhow::format_err!("invalid bind_address {:?} - {}", config.bind_address, err))?;
    let coordinator = Arc::new(Coordinator::new(config)?);
    api::serve(coordinator, addr).await
}
