use clap::Parser;
use rainstream_media::prelude::WorkerManager;
use rainstream_server::cluster_server::ClusterServer;
use rainstream_server::settings::{CliArgs, Settings};
use std::sync::Arc;

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let args = CliArgs::parse();
    let settings = Arc::new(Settings::load(&args)?);

    let worker_manager = WorkerManager::new(settings.worker.binary.clone());
    let server = ClusterServer::new(settings, worker_manager).await?;

    server.run().await
}
