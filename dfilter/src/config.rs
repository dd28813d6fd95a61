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

//! The unified configuration model for all components.
//!
//! The binary deserializes this from YAML; everything carries defaults so a
//! minimal file configures only what it cares about.

use crate::{
    manifest::{ManifestError, RuleSourceConfig},
    rules::precedence::WildcardMode,
    sched::UpdateStrategy,
    upstream::BindStrategy,
};
use chrono::{NaiveTime, Weekday};
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, HashSet},
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    path::PathBuf,
    str::FromStr,
    time::Duration,
};
use thiserror::Error;

/// A shorthand for returning configuration errors.
pub type Result<T> = std::result::Result<T, ConfigError>;

/// Fatal configuration problems; the manager enters its Error state on any.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A setting holds an unusable value.
    #[error("invalid configuration: {0}")]
    Invalid(String),

    /// A required setting is absent.
    #[error("missing required setting '{0}'")]
    Missing(&'static str),
}

impl From<ManifestError> for ConfigError {
    fn from(e: ManifestError) -> Self {
        ConfigError::Invalid(e.to_string())
    }
}

/// Which update strategy drives refreshes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StrategyKind {
    /// Fixed interval with jitter.
    #[default]
    Interval,
    /// Fixed wall-clock times.
    Scheduled,
    /// On demand only.
    Manual,
    /// Push-driven; without a push transport this degrades to an interval
    /// at `push_fallback_interval`.
    Push,
    /// Interval that adapts to outcomes.
    Adaptive,
}

/// Response/rule cache settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Directory for on-disk caches (manifests, persisted state).
    pub cache_directory: PathBuf,
    /// On-disk cache budget in bytes.
    pub max_cache_size: u64,
    /// Cap applied to upstream TTLs, seconds.
    pub default_ttl: u32,
    /// In-memory response cache budget in bytes.
    pub max_memory_cache_size: usize,
    /// Persist caches across restarts.
    pub persist_cache: bool,
    /// Expiry sweep period, seconds.
    pub cleanup_interval: u64,
    /// Lookups above this many milliseconds count as slow.
    pub slow_lookup_threshold_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_directory: PathBuf::from("/var/cache/dshield"),
            max_cache_size: 50 * 1024 * 1024,
            default_ttl: 3600,
            max_memory_cache_size: 4 * 1024 * 1024,
            persist_cache: true,
            cleanup_interval: 300,
            slow_lookup_threshold_ms: 10,
        }
    }
}

/// Adaptive strategy bounds and multipliers.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdaptiveConfig {
    /// Lower interval clamp, seconds.
    pub min_interval: u64,
    /// Upper interval clamp, seconds.
    pub max_interval: u64,
    /// Interval multiplier on success.
    pub success_multiplier: f64,
    /// Interval multiplier on failure.
    pub failure_multiplier: f64,
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            min_interval: 30,
            max_interval: 600,
            success_multiplier: 2.0,
            failure_multiplier: 0.5,
        }
    }
}

/// Update scheduling settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdateConfig {
    /// Strategy kind for sources without their own interval.
    pub strategy: StrategyKind,
    /// Base interval, seconds.
    pub interval: u64,
    /// `HH:mm` times for the scheduled strategy.
    pub scheduled_times: Vec<String>,
    /// Day names restricting the scheduled strategy; empty means every day.
    pub scheduled_days: Vec<String>,
    /// Retry bound for transient upstream failures.
    pub max_retries: u32,
    /// Initial retry backoff, milliseconds.
    pub retry_delay_ms: u64,
    /// Backoff ceiling, milliseconds.
    pub retry_ceiling_ms: u64,
    /// Refresh everything on startup.
    pub update_on_start: bool,
    /// Refresh on network changes.
    pub update_on_network_change: bool,
    /// Concurrent source updates bound.
    pub max_concurrent_updates: usize,
    /// Interval jitter fraction.
    pub jitter_percent: f64,
    /// Manual strategy retrigger guard, seconds.
    pub minimum_manual_interval: u64,
    /// Interval used when `Push` has no transport, seconds.
    pub push_fallback_interval: u64,
    /// Adaptive bounds.
    pub adaptive: AdaptiveConfig,
    /// Pause scheduling on expensive/constrained networks.
    pub pause_on_expensive_network: bool,
    /// Pause scheduling on low power.
    pub pause_on_low_power: bool,
    /// Per-fetch timeout, seconds.
    pub fetch_timeout: u64,
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            strategy: StrategyKind::Interval,
            interval: 3600,
            scheduled_times: Vec::new(),
            scheduled_days: Vec::new(),
            max_retries: 3,
            retry_delay_ms: 500,
            retry_ceiling_ms: 30_000,
            update_on_start: true,
            update_on_network_change: false,
            max_concurrent_updates: 2,
            jitter_percent: 0.1,
            minimum_manual_interval: 30,
            push_fallback_interval: 6 * 3600,
            adaptive: AdaptiveConfig::default(),
            pause_on_expensive_network: false,
            pause_on_low_power: false,
            fetch_timeout: 30,
        }
    }
}

impl UpdateConfig {
    fn scheduled(&self) -> Result<UpdateStrategy> {
        let times = self
            .scheduled_times
            .iter()
            .map(|t| {
                NaiveTime::parse_from_str(t, "%H:%M")
                    .map_err(|_| ConfigError::Invalid(format!("scheduled time '{}'", t)))
            })
            .collect::<Result<Vec<_>>>()?;
        let days = if self.scheduled_days.is_empty() {
            None
        } else {
            Some(
                self.scheduled_days
                    .iter()
                    .map(|d| {
                        Weekday::from_str(d)
                            .map_err(|_| ConfigError::Invalid(format!("scheduled day '{}'", d)))
                    })
                    .collect::<Result<Vec<_>>>()?,
            )
        };
        Ok(UpdateStrategy::Scheduled { times, days })
    }

    /// The concrete strategy for one source; `source_interval` (from the
    /// source descriptor) overrides the global interval.
    pub fn strategy_for(&self, source_interval: Option<u64>) -> Result<UpdateStrategy> {
        Ok(match self.strategy {
            StrategyKind::Interval => UpdateStrategy::Interval {
                every: Duration::from_secs(source_interval.unwrap_or(self.interval).max(1)),
                jitter_percent: self.jitter_percent,
            },
            StrategyKind::Scheduled => self.scheduled()?,
            StrategyKind::Manual => UpdateStrategy::Manual {
                minimum_interval: Duration::from_secs(self.minimum_manual_interval),
            },
            StrategyKind::Push => UpdateStrategy::Interval {
                every: Duration::from_secs(self.push_fallback_interval.max(1)),
                jitter_percent: self.jitter_percent,
            },
            StrategyKind::Adaptive => UpdateStrategy::Adaptive {
                base: Duration::from_secs(source_interval.unwrap_or(self.interval).max(1)),
                min: Duration::from_secs(self.adaptive.min_interval.max(1)),
                max: Duration::from_secs(self.adaptive.max_interval.max(1)),
                success_multiplier: self.adaptive.success_multiplier,
                failure_multiplier: self.adaptive.failure_multiplier,
            },
        })
    }
}

/// Manifest resolution settings.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManifestConfig {
    /// Use manifests at all.
    pub enabled: bool,
    /// Explicit root identifier override.
    pub identifier: Option<String>,
    /// Remote manifest endpoint mirrored into the cache directory.
    pub url: Option<String>,
    /// Local directories searched for manifest files.
    pub search_paths: Vec<PathBuf>,
    /// Remote manifest refresh period, seconds.
    pub update_interval: Option<u64>,
    /// Disk cache lifetime for manifests, seconds.
    pub cache_ttl: Option<u64>,
    /// Serve expired cached manifests when the source is unreachable.
    pub allow_expired: Option<bool>,
}

/// Hot rule-verdict cache settings.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LookupCacheConfig {
    /// Entry bound.
    pub capacity: usize,
    /// Per-entry lifetime, seconds.
    pub ttl: u64,
}

impl Default for LookupCacheConfig {
    fn default() -> Self {
        Self {
            capacity: crate::rules::lookup_cache::DEFAULT_CAPACITY,
            ttl: 300,
        }
    }
}

/// Everything the filtering core is configured by.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    /// Skip all network fetches; serve rules from disk caches only.
    pub offline_mode: bool,
    /// Verbose logging.
    pub debug_logging: bool,
    /// Upstream resolvers, `ip` or `ip:port`, in failover order.
    pub upstream_dns_servers: Vec<String>,
    /// Per-query upstream timeout, seconds.
    pub dns_timeout: u64,
    /// Wildcard root-matching mode.
    pub wildcard_mode: WildcardMode,
    /// Sinkhole address for blocked A queries.
    pub sinkhole_v4: Ipv4Addr,
    /// Sinkhole address for blocked AAAA queries.
    pub sinkhole_v6: Ipv6Addr,
    /// TTL on synthesized block answers, seconds.
    pub blocked_ttl: u32,
    /// Treat Redirect/Monitor rules as blocking instead of inert.
    pub enable_reserved_actions: bool,
    /// Rule store database file.
    pub db_path: PathBuf,
    /// Cache settings.
    pub cache: CacheConfig,
    /// Update scheduling settings.
    pub update: UpdateConfig,
    /// Manifest settings.
    pub manifest: ManifestConfig,
    /// Statically configured rule sources.
    pub rule_sources: Vec<RuleSourceConfig>,
    /// Hot verdict cache settings.
    pub lookup_cache: LookupCacheConfig,
    /// Extra headers on every HTTPS fetch.
    pub additional_http_headers: BTreeMap<String, String>,
    /// Keep upstream DNS flowing through the VPN's resolvers when present.
    pub enable_dns_chain_preservation: bool,
    /// CIDRs identifying VPN-side resolvers.
    pub vpn_resolvers: Vec<String>,
    /// Egress binding strategy.
    pub bind_strategy: BindStrategy,
    /// VPN tunnel device name, host-supplied.
    pub vpn_device: Option<String>,
    /// Default egress device name, host-supplied.
    pub default_device: Option<String>,
    /// Fail whole source payloads on any invalid entry.
    pub strict_parsing: bool,
    /// Reject source payloads with fewer rules than this.
    pub min_rule_count: usize,
    /// Reject source payloads larger than this many bytes.
    pub max_payload_bytes: u64,
    /// Bounded queue depth for queries arriving during reloads.
    pub transition_queue_depth: usize,
    /// Retry truncated UDP answers over TCP.
    pub tcp_fallback: bool,
    /// Device serial for manifest selection, host-supplied.
    pub device_serial: Option<String>,
    /// Log verbosity: off, error, warn, info, debug, trace.
    pub verbosity: String,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            offline_mode: false,
            debug_logging: false,
            upstream_dns_servers: vec!["1.1.1.1".into(), "8.8.8.8".into()],
            dns_timeout: 5,
            wildcard_mode: WildcardMode::default(),
            sinkhole_v4: Ipv4Addr::UNSPECIFIED,
            sinkhole_v6: Ipv6Addr::UNSPECIFIED,
            blocked_ttl: 60,
            enable_reserved_actions: false,
            db_path: PathBuf::from("/var/lib/dshield/rules.db"),
            cache: CacheConfig::default(),
            update: UpdateConfig::default(),
            manifest: ManifestConfig::default(),
            rule_sources: Vec::new(),
            lookup_cache: LookupCacheConfig::default(),
            additional_http_headers: BTreeMap::new(),
            enable_dns_chain_preservation: true,
            vpn_resolvers: Vec::new(),
            bind_strategy: BindStrategy::default(),
            vpn_device: None,
            default_device: None,
            strict_parsing: false,
            min_rule_count: 1,
            max_payload_bytes: 20 * 1024 * 1024,
            transition_queue_depth: 512,
            tcp_fallback: true,
            device_serial: None,
            verbosity: "info".into(),
        }
    }
}

impl FilterConfig {
    /// Resolver endpoints in failover order; a bare IP gets port 53.
    pub fn resolver_addrs(&self) -> Result<Vec<SocketAddr>> {
        if self.upstream_dns_servers.is_empty() {
            return Err(ConfigError::Missing("upstream_dns_servers"));
        }
        self.upstream_dns_servers
            .iter()
            .map(|s| {
                if let Ok(addr) = SocketAddr::from_str(s) {
                    return Ok(addr);
                }
                IpAddr::from_str(s)
                    .map(|ip| SocketAddr::new(ip, 53))
                    .map_err(|_| ConfigError::Invalid(format!("upstream server '{}'", s)))
            })
            .collect()
    }

    /// Check the whole configuration; any error here is fatal.
    pub fn validate(&self) -> Result<()> {
        self.resolver_addrs()?;
        if self.dns_timeout == 0 {
            return Err(ConfigError::Invalid("dns_timeout must be positive".into()));
        }
        if self.transition_queue_depth == 0 {
            return Err(ConfigError::Invalid(
                "transition_queue_depth must be positive".into(),
            ));
        }
        if self.update.strategy == StrategyKind::Scheduled {
            if self.update.scheduled_times.is_empty() {
                return Err(ConfigError::Missing("update.scheduled_times"));
            }
            self.update.scheduled()?;
        }
        let mut seen = HashSet::new();
        for source in &self.rule_sources {
            source.validate()?;
            if !seen.insert(source.identifier.clone()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate rule source identifier '{}'",
                    source.identifier
                )));
            }
        }
        if self.manifest.enabled && self.manifest.search_paths.is_empty()
            && self.manifest.url.is_none()
        {
            return Err(ConfigError::Missing("manifest.search_paths"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        FilterConfig::default().validate().unwrap();
    }

    #[test]
    fn resolver_parsing() {
        let mut cfg = FilterConfig::default();
        cfg.upstream_dns_servers = vec!["9.9.9.9".into(), "1.1.1.1:5353".into()];
        let addrs = cfg.resolver_addrs().unwrap();
        assert_eq!(addrs[0], "9.9.9.9:53".parse().unwrap());
        assert_eq!(addrs[1], "1.1.1.1:5353".parse().unwrap());

        cfg.upstream_dns_servers = vec!["not-an-ip".into()];
        assert!(cfg.validate().is_err());
        cfg.upstream_dns_servers.clear();
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::Missing("upstream_dns_servers"))
        ));
    }

    #[test]
    fn scheduled_strategy_requires_times() {
        let mut cfg = FilterConfig::default();
        cfg.update.strategy = StrategyKind::Scheduled;
        assert!(cfg.validate().is_err());
        cfg.update.scheduled_times = vec!["02:00".into(), "14:30".into()];
        cfg.update.scheduled_days = vec!["monday".into(), "friday".into()];
        cfg.validate().unwrap();
        cfg.update.scheduled_times = vec!["25:99".into()];
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn strategy_construction() {
        let update = UpdateConfig::default();
        match update.strategy_for(Some(1800)).unwrap() {
            UpdateStrategy::Interval { every, .. } => {
                assert_eq!(every, Duration::from_secs(1800))
            }
            other => panic!("unexpected strategy {:?}", other),
        }

        let mut push = UpdateConfig::default();
        push.strategy = StrategyKind::Push;
        assert!(matches!(
            push.strategy_for(None).unwrap(),
            UpdateStrategy::Interval { every, .. } if every == Duration::from_secs(6 * 3600)
        ));

        let mut adaptive = UpdateConfig::default();
        adaptive.strategy = StrategyKind::Adaptive;
        adaptive.interval = 60;
        assert!(matches!(
            adaptive.strategy_for(None).unwrap(),
            UpdateStrategy::Adaptive { base, .. } if base == Duration::from_secs(60)
        ));
    }

    #[test]
    fn duplicate_source_identifiers_rejected() {
        use crate::manifest::SourceKind;
        let source = RuleSourceConfig {
            identifier: "dup".into(),
            name: None,
            kind: SourceKind::File,
            format: None,
            url: None,
            path: Some(PathBuf::from("/tmp/list.hosts")),
            update_interval: 3600,
            priority: 0,
            enabled: true,
            auth: None,
            headers: BTreeMap::new(),
            pinned_cert_hashes: Vec::new(),
            accepted_statuses: Vec::new(),
            max_redirects: 5,
            allow_insecure_http: false,
            watch: false,
        };
        let mut cfg = FilterConfig::default();
        cfg.rule_sources = vec![source.clone(), source];
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn yaml_roundtrip_with_partial_file() {
        let yaml = r#"
upstream_dns_servers: ["9.9.9.9"]
wildcard_mode: include_root
blocked_ttl: 120
update:
  strategy: adaptive
  interval: 60
"#;
        let cfg: FilterConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cfg.blocked_ttl, 120);
        assert_eq!(cfg.wildcard_mode, WildcardMode::IncludeRoot);
        assert_eq!(cfg.update.strategy, StrategyKind::Adaptive);
        // Untouched settings keep their defaults.
        assert_eq!(cfg.dns_timeout, 5);
        cfg.validate().unwrap();
    }
}
