use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context as _;
use tokio::signal::unix::{SignalKind, signal};
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use hostgate::config::Config;
use hostgate::logging;
use hostgate::server::Listener;
use hostgate::snapshot::{SharedSnapshot, Snapshot};
use hostgate::tls;

#[tokio::main]
async fn main() {
    if let Err(e) = logging::init_from_env() {
        eprintln!("failed to initialize logging: {e}");
        std::process::exit(1);
    }

    let Some(config_path) = std::env::args().nth(1) else {
        eprintln!("usage: hostgate <config-file>");
        std::process::exit(2);
    };

    if let Err(err) = run(Path::new(&config_path)).await {
        error!("{err:#}");
        std::process::exit(1);
    }
}

async fn run(config_path: &Path) -> anyhow::Result<()> {
    let config = Config::load(config_path)?;
    let snapshot = Snapshot::build(&config)?;
    let shared = SharedSnapshot::new(snapshot);

    // One acceptor covers every TLS listener; the resolver picks the
    // certificate per handshake from the current snapshot.
    let listen_specs = config.listen_specs();
    let acceptor = listen_specs
        .iter()
        .any(|spec| spec.tls)
        .then(|| tls::build_acceptor(shared.clone()));

    let mut listeners = Vec::with_capacity(listen_specs.len());
    for spec in &listen_specs {
        let addr = SocketAddr::from(([0, 0, 0, 0], spec.port));
        let tls = if spec.tls { acceptor.clone() } else { None };
        let listener = Listener::bind(addr, tls, shared.clone())
            .await
            .with_context(|| format!("cannot listen on port {}", spec.port))?;
        listeners.push(listener);
    }

    spawn_reload_handler(shared.clone(), config_path.to_path_buf());

    info!("hostgate started with {} listener(s)", listeners.len());

    let mut tasks = JoinSet::new();
    for listener in listeners {
        tasks.spawn(listener.run());
    }
    // Accept loops run forever; reaching here means one of them panicked.
    while let Some(result) = tasks.join_next().await {
        if let Err(err) = result {
            error!("listener task failed: {err}");
        }
    }
    Ok(())
}

/// SIGHUP rebuilds the snapshot from the config file and swaps it in.
/// A failed reload keeps the running configuration. Listener changes
/// (new ports, ssl flips) require a restart.
fn spawn_reload_handler(shared: SharedSnapshot, config_path: PathBuf) {
    tokio::spawn(async move {
        let mut hup = match signal(SignalKind::hangup()) {
            Ok(hup) => hup,
            Err(err) => {
                warn!("SIGHUP handler unavailable, reload disabled: {err}");
                return;
            }
        };
        while hup.recv().await.is_some() {
            info!("reloading configuration from {}", config_path.display());
            match load_snapshot(&config_path) {
                Ok(snapshot) => {
                    shared.store(snapshot);
                    info!("configuration reloaded");
                }
                Err(err) => {
                    error!("reload failed, keeping previous configuration: {err}");
                }
            }
        }
    });
}

fn load_snapshot(path: &Path) -> Result<Arc<Snapshot>, hostgate::error::StartupError> {
    let config = Config::load(path)?;
    Snapshot::build(&config)
}
