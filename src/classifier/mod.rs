use std::net::IpAddr;
use std::sync::Arc;

use ipnet::IpNet;

use crate::config::MeshConfig;
use crate::geoip::{GeoInfo, GeoIp};
use crate::vpn::{PeerInfo, VpnStatusClient};

/// Where a connection came from. VPN variants carry the confirming peer when
/// the mesh API could resolve it; `peer: None` is a CIDR-only match.
#[derive(Debug, Clone)]
pub enum Origin {
    Vpn {
        mesh: String,
        peer: Option<PeerInfo>,
    },
    Public {
        geo: Option<GeoInfo>,
    },
}

impl Origin {
    /// Tag persisted in the feeder row (`conn_type` column).
    pub fn conn_type(&self) -> &str {
        match self {
            Origin::Vpn { mesh, .. } => mesh,
            Origin::Public { .. } => "public",
        }
    }

    pub fn hostname(&self) -> Option<&str> {
        match self {
            Origin::Vpn {
                peer: Some(peer), ..
            } => peer.hostname.as_deref(),
            _ => None,
        }
    }

    pub fn is_vpn(&self) -> bool {
        matches!(self, Origin::Vpn { .. })
    }
}

/// Full classification result for one source address.
#[derive(Debug, Clone)]
pub struct Classified {
    pub origin: Origin,
    /// Stable feeder key: the VPN peer ID when confirmed, else the address.
    pub identity: String,
    /// Display name to use if this feeder has never been seen before.
    pub name: String,
}

struct MeshRuntime {
    config: MeshConfig,
    net: IpNet,
}

/// Decides VPN-mesh vs. public origin for each source address. Meshes are
/// checked in configured order; overlapping CIDR ranges between providers
/// are expected during migration, so an API-confirmed match on an earlier
/// mesh always beats anything later, and a CIDR-only match still beats the
/// CIDR ranges of later meshes.
pub struct Classifier {
    meshes: Vec<MeshRuntime>,
    vpn: Arc<VpnStatusClient>,
    geoip: Option<GeoIp>,
}

impl Classifier {
    pub fn new(meshes: &[MeshConfig], vpn: Arc<VpnStatusClient>, geoip: Option<GeoIp>) -> Self {
        let meshes = meshes
            .iter()
            .filter(|m| m.enabled)
            .filter_map(|m| match m.cidr.parse::<IpNet>() {
                Ok(net) => Some(MeshRuntime {
                    config: m.clone(),
                    net,
                }),
                Err(e) => {
                    println!("[classifier] mesh {} has invalid CIDR {:?}: {}", m.name, m.cidr, e);
                    None
                }
            })
            .collect();

        Self { meshes, vpn, geoip }
    }

    pub async fn classify(&self, addr: IpAddr) -> Classified {
        // API-confirmed membership first, in priority order.
        for mesh in self.meshes.iter().filter(|m| m.net.contains(&addr)) {
            if let Some(peer) = self.vpn.resolve_peer(&mesh.config, addr).await {
                return self.vpn_result(mesh, addr, Some(peer));
            }
        }

        // CIDR-only fallback. An address inside a known private range is
        // never handed to public geolocation just because the API is down.
        if let Some(mesh) = self.meshes.iter().find(|m| m.net.contains(&addr)) {
            return self.vpn_result(mesh, addr, None);
        }

        self.classify_public(addr)
    }

    /// Classification without any API round-trip; used when the per-session
    /// classification deadline has already fired.
    pub fn classify_cidr_only(&self, addr: IpAddr) -> Classified {
        if let Some(mesh) = self.meshes.iter().find(|m| m.net.contains(&addr)) {
            return self.vpn_result(mesh, addr, None);
        }
        self.classify_public(addr)
    }

    fn vpn_result(&self, mesh: &MeshRuntime, addr: IpAddr, peer: Option<PeerInfo>) -> Classified {
        let identity = peer
            .as_ref()
            .map(|p| p.id.clone())
            .unwrap_or_else(|| addr.to_string());
        let name = peer
            .as_ref()
            .and_then(|p| p.hostname.clone())
            .unwrap_or_else(|| auto_name(addr, None));

        Classified {
            origin: Origin::Vpn {
                mesh: mesh.config.name.clone(),
                peer,
            },
            identity,
            name,
        }
    }

    fn classify_public(&self, addr: IpAddr) -> Classified {
        let geo = self.geoip.as_ref().and_then(|g| g.lookup(addr));
        let name = auto_name(addr, geo.as_ref().and_then(|g| g.location.as_deref()));

        Classified {
            origin: Origin::Public { geo },
            identity: addr.to_string(),
            name,
        }
    }
}

/// Synthesize a display name for a feeder without a hostname:
/// `feeder-<location-slug>-<suffix>`, or `feeder-<suffix>` when unlocated.
/// The suffix is the trailing digits of the address, enough to tell two
/// feeders in the same city apart.
pub fn auto_name(addr: IpAddr, location: Option<&str>) -> String {
    match location.map(location_slug).filter(|s| !s.is_empty()) {
        Some(slug) => format!("feeder-{}-{}", slug, short_suffix(addr)),
        None => format!("feeder-{}", short_suffix(addr)),
    }
}

fn location_slug(location: &str) -> String {
    location
        .to_lowercase()
        .replace(',', "")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("-")
}

fn short_suffix(addr: IpAddr) -> String {
    let digits: String = addr
        .to_string()
        .chars()
        .filter(|c| c.is_ascii_hexdigit())
        .collect();
    let start = digits.len().saturating_sub(4);
    digits[start..].to_string()
}
