use std::process;

use clap::Parser;
use log::error;
use socks4::{Config, SOCKS4Server};

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = Config::parse();
    if let Err(e) = config.validate() {
        error!("{}", e);
        process::exit(1);
    }

    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if let Some(workers) = config.workers {
        builder.worker_threads(workers);
    }
    let runtime = match builder.build() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("failed to start runtime: {}", e);
            process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(serve(config)) {
        error!("{}", e);
        process::exit(1);
    }
}

async fn serve(config: Config) -> socks4::Result<()> {
    let server = SOCKS4Server::bind(config.listen_addr()?, config.server_options()).await?;
    server.run().await;
    Ok(())
}
