//! Treemesh node binary.
//!
//! Runs one mesh node over the TCP link driver: joins (or seeds) a mesh,
//! answers protocol traffic, and optionally stands for bridge election
//! when router credentials are configured.

use clap::Parser;
use tracing::{info, warn};
use treemesh::link::tcp::{SeedPeer, TcpLinkConfig};
use treemesh::{BridgeStrategy, LocalObservation, Mesh, MeshConfig, NodeId};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "treemesh", version, about = "Treemesh: tree-overlay mesh node")]
struct Args {
    /// Node identifier (unique within the mesh)
    #[arg(short, long)]
    node_id: NodeId,

    /// Listen port
    #[arg(short, long, default_value = "5555")]
    port: u16,

    /// Mesh network name prefix
    #[arg(long, default_value = "treemesh")]
    prefix: String,

    /// Mesh password
    #[arg(long, default_value = "")]
    password: String,

    /// Notional operating channel
    #[arg(long, default_value = "1")]
    channel: u8,

    /// Seed peers, comma-separated host:port
    #[arg(short, long)]
    seeds: Option<String>,

    /// Upstream router SSID (enables bridge candidacy)
    #[arg(long)]
    router_ssid: Option<String>,

    /// Upstream router password
    #[arg(long, default_value = "")]
    router_password: String,

    /// Participate in bridge failover elections
    #[arg(long)]
    failover: bool,

    /// This host already has internet reachability (promotions succeed)
    #[arg(long)]
    internet: bool,

    /// Enable multi-bridge coordination
    #[arg(long)]
    multi_bridge: bool,

    /// Bridge selection strategy: priority, round-robin, best-signal
    #[arg(long, default_value = "priority")]
    strategy: String,

    /// Offline queue backing file (JSON-lines)
    #[arg(long)]
    queue_file: Option<std::path::PathBuf>,

    /// Debug category bitfield (see DebugCategories)
    #[arg(long, default_value = "3")]
    debug_categories: u32,
}

fn build_config(args: &Args) -> MeshConfig {
    let mut config = MeshConfig::default();
    config.mesh_prefix = args.prefix.clone();
    config.mesh_password = args.password.clone();
    config.mesh_port = args.port;
    if let Some(ssid) = &args.router_ssid {
        config.bridge.router_ssid = ssid.clone();
        config.bridge.router_password = args.router_password.clone();
    }
    config.bridge.failover_enabled = args.failover;
    config.bridge.multi_bridge.enabled = args.multi_bridge;
    config.bridge.multi_bridge.strategy = match args.strategy.as_str() {
        "round-robin" => BridgeStrategy::RoundRobin,
        "best-signal" => BridgeStrategy::BestSignal,
        _ => BridgeStrategy::PriorityBased,
    };
    config.message_queue.storage_path = args.queue_file.clone();
    config.debug_msg_types = treemesh::DebugCategories(args.debug_categories);
    config.sanitized()
}

fn parse_seeds(args: &Args) -> Vec<SeedPeer> {
    args.seeds
        .as_deref()
        .unwrap_or("")
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|addr| SeedPeer {
            addr: addr.to_string(),
            rssi: -50,
            channel: args.channel,
            ssid: args.prefix.clone(),
        })
        .collect()
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let config = build_config(&args);
    let seeds = parse_seeds(&args);

    let mut filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive("treemesh=info".parse().expect("static directive"));
    for directive in config.debug_msg_types.tracing_directives() {
        match directive.parse() {
            Ok(d) => filter = filter.add_directive(d),
            Err(e) => eprintln!("bad log directive {directive}: {e}"),
        }
    }
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("════════════════════════════════════════════════════════════");
    info!("  treemesh v{VERSION}");
    info!("════════════════════════════════════════════════════════════");
    info!(
        "Node {} | port {} | prefix {} | channel {}",
        args.node_id, args.port, args.prefix, args.channel
    );
    if !seeds.is_empty() {
        info!("Seeds: {:?}", seeds.iter().map(|s| &s.addr).collect::<Vec<_>>());
    }
    if config.bridge_capable() {
        info!(
            "Bridge-capable (router {} | failover {})",
            config.bridge.router_ssid, config.bridge.failover_enabled
        );
    }

    let link_config = TcpLinkConfig {
        listen_port: args.port,
        seeds,
        channel: args.channel,
    };
    let mut mesh = match Mesh::new(config, args.node_id, link_config).await {
        Ok(m) => m,
        Err(e) => {
            warn!("failed to start mesh: {e}");
            return;
        }
    };

    let core = mesh.core_mut();
    core.set_on_receive(Box::new(|view| {
        info!(
            "app message type {} from {} ({} bytes)",
            view.envelope.type_code,
            view.envelope.from,
            view.raw_line().len()
        );
    }));
    core.set_on_dropped(Box::new(|peer| info!("peer {peer} dropped")));
    core.set_on_bridge_status_changed(Box::new(|bridge, internet| {
        info!("bridge {bridge} internet={internet}");
    }));
    core.set_on_bridge_role_changed(Box::new(|is_bridge, reason| {
        info!("bridge role: active={is_bridge} ({reason})");
    }));
    core.set_on_queue_flush(Box::new(|batch| {
        info!("uplink restored: {} queued messages ready", batch.len());
    }));
    if args.internet {
        core.set_auto_associate(Some(true));
        core.set_observation(LocalObservation {
            router_rssi: -50,
            router_channel: args.channel,
            uptime_secs: 0,
            free_memory: 0,
            gateway_ip: String::new(),
        });
    }

    tokio::select! {
        _ = mesh.run() => {}
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
        }
    }
    mesh.shutdown();
}
