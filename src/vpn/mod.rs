use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Deserialize;

use crate::config::MeshConfig;

/// How long a fetched peer list stays valid. Bounds control-plane API volume
/// to roughly one request per mesh per TTL regardless of connection rate.
pub const PEER_CACHE_TTL: Duration = Duration::from_secs(60);

/// Per-request budget for the control-plane API. A hung management endpoint
/// must not stall the classification path for longer than this.
const API_TIMEOUT: Duration = Duration::from_secs(2);

/// One mesh peer as reported by the management API.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerInfo {
    pub id: String,
    pub hostname: Option<String>,
    pub online: bool,
}

// Wire shape of a `GET /api/peers` entry. Providers disagree on which of
// `name`/`hostname` they populate, and some list extra addresses.
#[derive(Deserialize)]
struct ApiPeer {
    id: Option<String>,
    name: Option<String>,
    hostname: Option<String>,
    ip: Option<String>,
    #[serde(default)]
    ip_addresses: Vec<String>,
    #[serde(default)]
    connected: bool,
}

struct MeshCache {
    peers: HashMap<IpAddr, PeerInfo>,
    fetched_at: Instant,
}

/// Client for the VPN mesh management APIs with a shared, TTL-bounded peer
/// cache per mesh. Created once at startup and shared by every session; all
/// failures surface as "unresolved", never as errors to the caller.
pub struct VpnStatusClient {
    http: reqwest::Client,
    caches: DashMap<String, MeshCache>,
    refresh_lock: tokio::sync::Mutex<()>,
    ttl: Duration,
}

impl VpnStatusClient {
    pub fn new() -> anyhow::Result<Self> {
        Self::with_ttl(PEER_CACHE_TTL)
    }

    pub fn with_ttl(ttl: Duration) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder().timeout(API_TIMEOUT).build()?;
        Ok(Self {
            http,
            caches: DashMap::new(),
            refresh_lock: tokio::sync::Mutex::new(()),
            ttl,
        })
    }

    /// Look up the peer owning `addr` on `mesh`. `None` means the API could
    /// not confirm membership (peer unknown, API unreachable, auth failure).
    pub async fn resolve_peer(&self, mesh: &MeshConfig, addr: IpAddr) -> Option<PeerInfo> {
        self.ensure_fresh(mesh).await;
        self.caches
            .get(&mesh.name)
            .and_then(|cache| cache.peers.get(&addr).cloned())
    }

    /// Snapshot of all known peers on `mesh` (possibly stale up to the TTL).
    pub async fn list_peers(&self, mesh: &MeshConfig) -> Vec<PeerInfo> {
        self.ensure_fresh(mesh).await;
        self.caches
            .get(&mesh.name)
            .map(|cache| cache.peers.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Drop all cached peer lists so the next classification refetches.
    pub fn invalidate(&self) {
        self.caches.clear();
    }

    async fn ensure_fresh(&self, mesh: &MeshConfig) {
        if self.is_fresh(&mesh.name) {
            return;
        }

        // Serialize refreshes so a burst of connections costs one fetch.
        let _guard = self.refresh_lock.lock().await;
        if self.is_fresh(&mesh.name) {
            return;
        }

        match self.fetch_peers(mesh).await {
            Ok(peers) => {
                self.caches.insert(
                    mesh.name.clone(),
                    MeshCache {
                        peers,
                        fetched_at: Instant::now(),
                    },
                );
            }
            Err(e) => {
                println!("[vpn] {} peer refresh failed: {}", mesh.name, e);
                // Keep whatever we had, but stamp it so we do not hammer a
                // down API once per connection.
                match self.caches.get_mut(&mesh.name) {
                    Some(mut cache) => cache.fetched_at = Instant::now(),
                    None => {
                        self.caches.insert(
                            mesh.name.clone(),
                            MeshCache {
                                peers: HashMap::new(),
                                fetched_at: Instant::now(),
                            },
                        );
                    }
                }
            }
        }
    }

    fn is_fresh(&self, mesh_name: &str) -> bool {
        self.caches
            .get(mesh_name)
            .map(|cache| cache.fetched_at.elapsed() < self.ttl)
            .unwrap_or(false)
    }

    async fn fetch_peers(&self, mesh: &MeshConfig) -> anyhow::Result<HashMap<IpAddr, PeerInfo>> {
        let url = format!("{}/api/peers", mesh.api_url.trim_end_matches('/'));

        let mut request = self.http.get(&url);
        if !mesh.api_token.is_empty() {
            request = request.bearer_auth(&mesh.api_token);
        }

        let response = request.send().await?.error_for_status()?;
        let peers: Vec<ApiPeer> = response.json().await?;

        let mut mapping = HashMap::new();
        for peer in peers {
            let id = match peer.id.clone().or_else(|| peer.ip.clone()) {
                Some(id) => id,
                None => continue,
            };
            let info = PeerInfo {
                id,
                hostname: peer.name.clone().or_else(|| peer.hostname.clone()),
                online: peer.connected,
            };

            for addr in peer.ip.iter().chain(peer.ip_addresses.iter()) {
                if let Ok(parsed) = addr.parse::<IpAddr>() {
                    mapping.insert(parsed, info.clone());
                }
            }
        }
        Ok(mapping)
    }
}
