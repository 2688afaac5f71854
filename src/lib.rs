pub mod bridge;
pub mod config;
pub mod connection;
pub mod error;
pub mod link;
pub mod mesh;
pub mod plugin;
pub mod queue;
pub mod router;
pub mod scheduler;
pub mod timesync;
pub mod topology;
pub mod types;
pub mod wire;

pub use bridge::{
    BRIDGE_HEALTH_WINDOW_MS, BridgeCoordinator, BridgeInfo, BridgeRank, BridgeRole,
    ElectionCandidate, LocalObservation, ROLE_CHANGE_COOLDOWN_MS, election_winner,
};
pub use config::{
    BridgeConfig, BridgeStrategy, DebugCategories, MeshConfig, MultiBridgeConfig, QueueConfig,
};
pub use connection::{ConnState, Connection, ConnectionInfo, Side};
pub use error::{MeshError, Result};
pub use link::{
    ConnId, LineAssembler, LinkDriver, LinkEvent, ScanCandidate, ScanScope,
    tcp::{SeedPeer, TcpLinkConfig, TcpLinkDriver},
};
pub use mesh::{Mesh, MeshCore, MeshStats};
pub use plugin::{Dispatch, InternalTarget, PluginRegistry};
pub use queue::{MessageQueue, QueueState, QueueStats, QueuedMessage};
pub use router::{DedupCache, Router};
pub use scheduler::{Repeat, Scheduler, TaskHandle};
pub use timesync::TimeSync;
pub use topology::{ScanOutcome, Topology};
pub use types::*;
pub use wire::{Body, Envelope, PackageView};
