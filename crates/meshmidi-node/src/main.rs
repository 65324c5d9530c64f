/// meshmidi-node: one mesh participant. Advertises itself, finds peers,
/// handshakes and maintains connections, and routes MIDI between local
/// hardware and the rest of the mesh.
///
/// Orchestration follows the reference host daemon: parse args, load
/// config, build the shared state, spawn one task per subsystem, wait for
/// Ctrl-C, cancel the shared shutdown token and give every task a grace
/// period to drain before the process exits.
mod connection;
mod control_api;
mod discovery;
mod handshake;
mod heartbeat;
mod local_io;
mod mesh;
mod metrics;
mod router;
mod state;
mod uuid_registry;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use meshmidi_protocol::config::NodeConfig;
use meshmidi_protocol::identity::{IdentityLock, NodeIdentity};
use meshmidi_protocol::routing::DeviceInfo;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::state::NodeState;

#[derive(Parser, Debug)]
#[command(name = "meshmidi-node", about = "Zero-configuration network MIDI mesh node")]
struct Args {
    #[arg(short, long, default_value = "/etc/meshmidi/node.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    let config = match tokio::fs::read_to_string(&args.config).await {
        Ok(raw) => NodeConfig::from_toml_str(&raw).unwrap_or_else(|e| {
            error!(error = %e, path = ?args.config, "failed to parse config, using defaults");
            NodeConfig::default()
        }),
        Err(e) => {
            info!(error = %e, path = ?args.config, "no config file found, using defaults");
            NodeConfig::default()
        }
    };

    let state_dir = PathBuf::from(&config.node.state_dir);
    let identity = NodeIdentity::load_or_create(&state_dir, &config.node.name)?;
    let _lock = IdentityLock::acquire(&state_dir)?;

    info!(uuid = %identity.uuid, name = %identity.name, "node identity loaded");

    let data_bind: SocketAddr = format!("{}:{}", config.network.interface, config.network.data_port).parse()?;
    let data_socket = Arc::new(UdpSocket::bind(data_bind).await?);
    info!(addr = %data_bind, "data socket bound");

    let local_devices: Vec<DeviceInfo> = meshmidi_device::enumerate()
        .map(|ports| {
            ports
                .into_iter()
                .map(|p| DeviceInfo {
                    device_id: p.id,
                    name: p.name,
                    direction: p.direction,
                    owner: None,
                })
                .collect()
        })
        .unwrap_or_else(|e| {
            error!(error = %e, "local MIDI enumeration failed, continuing with no local devices");
            Vec::new()
        });
    info!(count = local_devices.len(), "local MIDI devices enumerated");

    let (inbound_tx, inbound_rx) = mpsc::channel(1024);
    let state = Arc::new(NodeState::new(config.clone(), identity, Arc::clone(&data_socket), inbound_tx));
    *state.local_devices.write().expect("local devices poisoned") = local_devices;
    local_io::open_local_ports(Arc::clone(&state)).await;

    let (discovery_tx, discovery_rx) = mpsc::channel(256);

    let mut handles = Vec::new();

    handles.push(tokio::spawn(mesh::run_data_recv(Arc::clone(&state))));
    handles.push(tokio::spawn(mesh::run_inbound_dispatch(Arc::clone(&state), inbound_rx)));
    handles.push(tokio::spawn(mesh::run_discovery_dispatch(Arc::clone(&state), discovery_rx)));
    handles.push(tokio::spawn(heartbeat::run(Arc::clone(&state))));

    let mut providers: Vec<Arc<dyn discovery::DiscoveryProvider>> = Vec::new();
    if state.config.discovery.mdns_enabled {
        providers.push(Arc::new(discovery::MdnsProvider));
    }
    providers.push(Arc::new(discovery::MulticastProvider));

    for provider in providers {
        let state = Arc::clone(&state);
        let tx = discovery_tx.clone();
        handles.push(tokio::spawn(async move {
            if let Err(e) = provider.run(state, tx).await {
                error!(provider = provider.name(), error = %e, "discovery task exited");
            }
        }));
    }

    let control_addr: SocketAddr = state.config.control.listen.parse()?;
    let control_router = control_api::build_router(Arc::clone(&state));
    let control_shutdown = state.shutdown.clone();
    handles.push(tokio::spawn(async move {
        match tokio::net::TcpListener::bind(control_addr).await {
            Ok(listener) => {
                info!(addr = %control_addr, "control API listening");
                let serve = axum::serve(
                    listener,
                    control_router.into_make_service_with_connect_info::<SocketAddr>(),
                )
                .with_graceful_shutdown(async move { control_shutdown.cancelled().await });
                if let Err(e) = serve.await {
                    error!(error = %e, "control API server exited");
                }
            }
            Err(e) => error!(error = %e, addr = %control_addr, "failed to bind control API"),
        }
    }));

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received, stopping all subsystems");
    state.shutdown.cancel();

    let drain = async {
        for handle in handles {
            let _ = handle.await;
        }
    };
    if tokio::time::timeout(std::time::Duration::from_secs(5), drain).await.is_err() {
        warn!("subsystems did not drain within the shutdown grace period");
    }
    for conn in state.connections_snapshot() {
        conn.abort();
    }

    Ok(())
}
