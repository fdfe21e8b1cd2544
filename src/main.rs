use dsm_coherence::{log, Cluster, Config};
use std::{env, process};

#[tokio::main]
async fn main() {
    let config = match env::args().nth(1) {
        Some(path) => match Config::from_json_file(&path) {
            Ok(config) => config,
            Err(e) => {
                log::error(&format!("Failed to load {path}: {e}"));
                process::exit(1);
            }
        },
        None => Config::default(),
    };
    log::set_debug(config.debug);

    let cluster = match Cluster::start(&config) {
        Ok(cluster) => cluster,
        Err(e) => {
            log::error(&format!("{e}"));
            process::exit(1);
        }
    };
    log::info("Running, press Ctrl-C to stop.");

    let mut status = tokio::time::interval(config.timeout());
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    log::error(&format!("Failed to listen for Ctrl-C: {e}"));
                }
                break;
            }
            _ = status.tick() => log::info(&cluster.summary()),
        }
    }

    log::info("Shutting down.");
    cluster.shutdown().await;
}
