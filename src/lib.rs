pub mod classifier;
pub mod config;
pub mod geoip;
pub mod logger;
pub mod registry;
pub mod server;
pub mod session;
pub mod sweeper;
pub mod utils;
pub mod vpn;

pub use classifier::{Classified, Classifier, Origin};
pub use config::{ConfigManager, IngestConfig};
pub use geoip::{GeoInfo, GeoIp};
pub use logger::{Logger, LogLevel};
pub use registry::{ActivityKind, FeederObservation, FeederRegistry, RegistryError};
pub use server::IngestServer;
pub use session::SessionContext;
pub use vpn::{PeerInfo, VpnStatusClient};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = "Skyfeed";
