use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use nfs_gate::config::{self, Cli, FileConfig};
use nfs_gate::nfs::NfsAdapter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let cli = Cli::parse();

    let file = match &cli.config {
        Some(path) => match config::load_file(path) {
            Ok(file) => file,
            Err(err) => {
                error!(%err, "configuration error");
                std::process::exit(2);
            }
        },
        None => FileConfig::default(),
    };

    let spec = match config::parse_backend_spec(&cli.backend) {
        Ok(spec) => spec,
        Err(err) => {
            error!(%err, "backend spec error");
            std::process::exit(2);
        }
    };

    let ttl = config::resolve_ttl(cli.ttl, &file);
    let backend = match config::build_backend_blocking(spec, ttl).await {
        Ok(backend) => backend,
        Err(err) => {
            error!(%err, "backend initialization failed");
            std::process::exit(1);
        }
    };

    let adapter = NfsAdapter::new(backend, file.allow.clone());
    let listen = cli
        .listen
        .or(file.listen)
        .unwrap_or_else(|| "127.0.0.1:2049".parse().expect("default listen address"));
    info!(%listen, export = %adapter.export_name(), "gateway ready");

    // The wire engine drives the adapter from here; this process stays
    // alive until interrupted, then releases the backend.
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(%err, "signal wait failed");
    }
    if let Err(err) = adapter.shutdown().await {
        error!(%err, "backend close failed");
        std::process::exit(1);
    }
    info!("clean shutdown");
}
