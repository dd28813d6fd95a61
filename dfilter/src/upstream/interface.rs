// Copyright 2024 dshield developers
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

//! Egress interface decisions for upstream DNS flows.
//!
//! When a VPN tunnel is up, resolvers inside the tunnel's CIDRs must be
//! reached through the tunnel device and everything else must not. Bindings
//! stick per transaction so retries never split across paths mid-query.

use super::{Result, UpstreamError};
use cidr_utils::cidr::IpCidr;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    net::{IpAddr, SocketAddr},
    str::FromStr,
    sync::Mutex,
    time::{Duration, Instant},
};
use tokio::sync::watch;

/// How to choose the egress interface for an upstream flow.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BindStrategy {
    /// Resolver inside a VPN CIDR goes out the VPN device, others do not.
    #[default]
    ResolverCidr,
    /// Use the interface the client's query arrived on.
    OriginalPath,
    /// Use the system's active-resolver interface.
    ActiveResolver,
}

/// Rough interface classification, by conventional device naming.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InterfaceKind {
    /// Not recognized.
    Unknown,
    /// Tunnel devices: utun*, ipsec*, ppp*, wg*, tun*.
    Vpn,
    /// Wireless devices.
    WiFi,
    /// Wired devices.
    Ethernet,
    /// Cellular devices.
    Cellular,
}

/// Classify a device name.
pub fn classify_device(name: &str) -> InterfaceKind {
    let lowered = name.to_ascii_lowercase();
    if ["utun", "ipsec", "ppp", "wg", "tun"]
        .iter()
        .any(|p| lowered.starts_with(p))
    {
        InterfaceKind::Vpn
    } else if lowered.starts_with("wlan") || lowered.starts_with("wl") {
        InterfaceKind::WiFi
    } else if lowered.starts_with("en") || lowered.starts_with("eth") {
        InterfaceKind::Ethernet
    } else if lowered.starts_with("pdp_ip") || lowered.starts_with("rmnet") {
        InterfaceKind::Cellular
    } else {
        InterfaceKind::Unknown
    }
}

/// One egress decision.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InterfaceBinding {
    /// Device to bind, `None` for the default route.
    pub device: Option<String>,
    /// Classification of that device.
    pub kind: InterfaceKind,
    /// Resolver this binding is for.
    pub resolver: SocketAddr,
}

/// Network path changes the data plane must react to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PathEvent {
    /// A VPN tunnel came up.
    VpnUp,
    /// The VPN tunnel went away.
    VpnDown,
}

struct StoredBinding {
    binding: InterfaceBinding,
    created: Instant,
}

/// Decides and remembers egress bindings; observes VPN path state.
pub struct InterfaceManager {
    strategy: BindStrategy,
    vpn_cidrs: Vec<IpCidr>,
    vpn_device: Option<String>,
    default_device: Option<String>,
    binding_ttl: Duration,
    bindings: Mutex<HashMap<u16, StoredBinding>>,
    vpn_state: watch::Sender<bool>,
}

impl InterfaceManager {
    /// Build from configuration. `vpn_cidrs` are textual CIDRs; `vpn_device`
    /// and `default_device` are host-supplied device names.
    pub fn new(
        strategy: BindStrategy,
        vpn_cidrs: &[String],
        vpn_device: Option<String>,
        default_device: Option<String>,
    ) -> Result<Self> {
        let vpn_cidrs = vpn_cidrs
            .iter()
            .map(|c| {
                IpCidr::from_str(c).map_err(|_| UpstreamError::InvalidCidr(c.clone()))
            })
            .collect::<Result<Vec<_>>>()?;
        let (vpn_state, _) = watch::channel(false);
        Ok(Self {
            strategy,
            vpn_cidrs,
            vpn_device,
            default_device,
            binding_ttl: Duration::from_secs(30),
            bindings: Mutex::new(HashMap::new()),
            vpn_state,
        })
    }

    /// The configured strategy.
    pub fn strategy(&self) -> BindStrategy {
        self.strategy
    }

    /// Whether the resolver address falls inside a configured VPN CIDR.
    pub fn is_resolver_in_vpn(&self, resolver: IpAddr) -> bool {
        self.vpn_cidrs.iter().any(|cidr| cidr.contains(resolver))
    }

    /// Whether a VPN tunnel is currently up.
    pub fn vpn_active(&self) -> bool {
        *self.vpn_state.borrow()
    }

    /// Observe VPN up/down transitions.
    pub fn subscribe_path(&self) -> watch::Receiver<bool> {
        self.vpn_state.subscribe()
    }

    /// Feed a VPN state change from the host's path monitor. On an actual
    /// transition all bindings are invalidated and the event is returned so
    /// the caller can purge response-cache entries and rebuild pools.
    pub fn set_vpn_state(&self, up: bool) -> Option<PathEvent> {
        let changed = self.vpn_state.send_replace(up) != up;
        if !changed {
            return None;
        }
        self.bindings.lock().unwrap().clear();
        info!("VPN path {}", if up { "up" } else { "down" });
        Some(if up { PathEvent::VpnUp } else { PathEvent::VpnDown })
    }

    // The decision for a fresh transaction.
    fn decide(&self, resolver: SocketAddr, original_device: Option<&str>) -> InterfaceBinding {
        let device = match self.strategy {
            BindStrategy::ResolverCidr => {
                if self.is_resolver_in_vpn(resolver.ip()) {
                    self.vpn_device.clone()
                } else {
                    self.default_device.clone()
                }
            }
            BindStrategy::OriginalPath => original_device
                .map(str::to_string)
                .or_else(|| self.default_device.clone()),
            BindStrategy::ActiveResolver => self.default_device.clone(),
        };
        let kind = device
            .as_deref()
            .map(classify_device)
            .unwrap_or(InterfaceKind::Unknown);
        InterfaceBinding {
            device,
            kind,
            resolver,
        }
    }

    /// The binding for `(txid, resolver)`. An existing unexpired binding is
    /// returned as-is so retries stay on one path; otherwise a fresh
    /// decision is stored and returned.
    pub fn binding_for(
        &self,
        txid: u16,
        resolver: SocketAddr,
        original_device: Option<&str>,
    ) -> InterfaceBinding {
        let mut bindings = self.bindings.lock().unwrap();
        if let Some(stored) = bindings.get(&txid) {
            if stored.created.elapsed() <= self.binding_ttl
                && stored.binding.resolver == resolver
            {
                return stored.binding.clone();
            }
        }
        let binding = self.decide(resolver, original_device);
        debug!(
            "binding txid {:#06x} to {:?} for resolver {}",
            txid, binding.device, resolver
        );
        bindings.insert(
            txid,
            StoredBinding {
                binding: binding.clone(),
                created: Instant::now(),
            },
        );
        binding
    }

    /// Drop a transaction's binding once the query reaches a terminal state.
    pub fn clear_binding(&self, txid: u16) {
        self.bindings.lock().unwrap().remove(&txid);
    }

    /// Sweep bindings older than the per-query lifetime.
    pub fn sweep_expired(&self) {
        let mut bindings = self.bindings.lock().unwrap();
        bindings.retain(|_, stored| stored.created.elapsed() <= self.binding_ttl);
    }

    /// Per-resolver egress devices for pool construction under the current
    /// strategy and path state.
    pub fn device_map(&self, resolvers: &[SocketAddr]) -> HashMap<SocketAddr, String> {
        let mut map = HashMap::new();
        for resolver in resolvers {
            let binding = self.decide(*resolver, None);
            if let Some(device) = binding.device {
                map.insert(*resolver, device);
            }
        }
        map
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(strategy: BindStrategy) -> InterfaceManager {
        InterfaceManager::new(
            strategy,
            &["10.8.0.0/16".to_string(), "fd00::/8".to_string()],
            Some("utun3".into()),
            Some("en0".into()),
        )
        .unwrap()
    }

    #[test]
    fn classification_by_name() {
        assert_eq!(classify_device("utun3"), InterfaceKind::Vpn);
        assert_eq!(classify_device("wg0"), InterfaceKind::Vpn);
        assert_eq!(classify_device("en0"), InterfaceKind::Ethernet);
        assert_eq!(classify_device("wlan0"), InterfaceKind::WiFi);
        assert_eq!(classify_device("pdp_ip0"), InterfaceKind::Cellular);
        assert_eq!(classify_device("weird9"), InterfaceKind::Unknown);
    }

    #[test]
    fn resolver_cidr_strategy_splits_paths() {
        let mgr = manager(BindStrategy::ResolverCidr);
        let vpn_resolver: SocketAddr = "10.8.0.1:53".parse().unwrap();
        let public_resolver: SocketAddr = "9.9.9.9:53".parse().unwrap();

        let b = mgr.binding_for(1, vpn_resolver, None);
        assert_eq!(b.device.as_deref(), Some("utun3"));
        assert_eq!(b.kind, InterfaceKind::Vpn);

        let b = mgr.binding_for(2, public_resolver, None);
        assert_eq!(b.device.as_deref(), Some("en0"));
    }

    #[test]
    fn original_path_strategy_prefers_arrival_device() {
        let mgr = manager(BindStrategy::OriginalPath);
        let resolver: SocketAddr = "9.9.9.9:53".parse().unwrap();
        let b = mgr.binding_for(1, resolver, Some("wlan0"));
        assert_eq!(b.device.as_deref(), Some("wlan0"));
        let b = mgr.binding_for(2, resolver, None);
        assert_eq!(b.device.as_deref(), Some("en0"));
    }

    #[test]
    fn bindings_are_sticky_per_txid() {
        let mgr = manager(BindStrategy::OriginalPath);
        let resolver: SocketAddr = "9.9.9.9:53".parse().unwrap();
        let first = mgr.binding_for(7, resolver, Some("wlan0"));
        // A retry for the same txid keeps the original decision even if the
        // hint changed.
        let retry = mgr.binding_for(7, resolver, Some("en5"));
        assert_eq!(first, retry);

        mgr.clear_binding(7);
        let fresh = mgr.binding_for(7, resolver, Some("en5"));
        assert_eq!(fresh.device.as_deref(), Some("en5"));
    }

    #[test]
    fn vpn_transition_invalidates_bindings() {
        let mgr = manager(BindStrategy::ResolverCidr);
        let resolver: SocketAddr = "10.8.0.1:53".parse().unwrap();
        mgr.binding_for(1, resolver, None);

        assert_eq!(mgr.set_vpn_state(true), Some(PathEvent::VpnUp));
        assert!(mgr.bindings.lock().unwrap().is_empty());
        // Same state again is not a transition.
        assert_eq!(mgr.set_vpn_state(true), None);
        assert_eq!(mgr.set_vpn_state(false), Some(PathEvent::VpnDown));
    }

    #[test]
    fn device_map_for_pool_construction() {
        let mgr = manager(BindStrategy::ResolverCidr);
        let resolvers = [
            "10.8.0.1:53".parse().unwrap(),
            "9.9.9.9:53".parse().unwrap(),
        ];
        let map = mgr.device_map(&resolvers);
        assert_eq!(map.get(&resolvers[0]).map(String::as_str), Some("utun3"));
        assert_eq!(map.get(&resolvers[1]).map(String::as_str), Some("en0"));
    }

    #[test]
    fn invalid_cidr_is_rejected() {
        assert!(InterfaceManager::new(
            BindStrategy::ResolverCidr,
            &["not-a-cidr".to_string()],
            None,
            None
        )
        .is_err());
    }
}
