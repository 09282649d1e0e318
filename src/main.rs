use anyhow::Result;
use warp_session_auth::{config, server, supervisor, telemetry};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    // a missing .env is fine; real deployments set the environment directly
    let _ = dotenvy::dotenv();

    let config = config::ServerConfig::from_matches(&config::new().get_matches())?;

    telemetry::init(config.verbosity)?;

    match config.worker_id {
        Some(worker_id) => server::run_worker(&config, worker_id).await,
        None if config.workers == 1 => server::run_worker(&config, 0).await,
        None => supervisor::run(&config).await,
    }
}
