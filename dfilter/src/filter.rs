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

//! The assembled filtering core: one handle wiring the rule manager, the
//! query pipeline, the caches, and the interface/retry managers together.

use crate::{
    cache::{PersistedResponse, ResponseCache},
    config::FilterConfig,
    error::{FilterError, Result},
    fetch::{CredentialStore, NoCredentials},
    manager::{ManagerState, RuleManager, RulesEvent},
    manifest::EvaluationContext,
    pipeline::{FlowHandle, PipelineConfig, QueryPipeline},
    rules::{lookup_cache::LookupCache, store::RuleStore},
    sched::UpdatePriority,
    upstream::{InterfaceManager, RetryManager, Upstreams},
    AsyncTryInto,
};
use async_trait::async_trait;
use bytes::Bytes;
use log::{info, warn};
use serde::Serialize;
use std::{
    collections::{BTreeMap, HashSet},
    path::{Path, PathBuf},
    sync::{Arc, Mutex, RwLock},
    time::Duration,
};
use tokio::task::JoinHandle;

fn response_cache_dir(config: &FilterConfig) -> PathBuf {
    config.cache.cache_directory.join("responses")
}

// File-per-entry response cache persistence. Filenames are hex of the qname
// plus the qtype so they stay filesystem-safe.
async fn load_persisted_responses(dir: &Path, responses: &ResponseCache) {
    let mut entries = Vec::new();
    let Ok(mut read) = tokio::fs::read_dir(dir).await else {
        return;
    };
    while let Ok(Some(file)) = read.next_entry().await {
        let Ok(data) = tokio::fs::read(file.path()).await else {
            continue;
        };
        match serde_json::from_slice::<PersistedResponse>(&data) {
            Ok(entry) => entries.push(entry),
            Err(_) => {
                // Corrupted entries degrade silently to a cold cache.
                let _ = tokio::fs::remove_file(file.path()).await;
            }
        }
    }
    if !entries.is_empty() {
        info!("restoring {} persisted response(s)", entries.len());
        responses.import(entries);
    }
}

async fn persist_responses(dir: &Path, responses: &ResponseCache) {
    if tokio::fs::create_dir_all(dir).await.is_err() {
        return;
    }
    let mut keep = HashSet::new();
    for entry in responses.export() {
        let name = format!("{}-{}.json", hex::encode(entry.qname.as_bytes()), entry.qtype);
        if let Ok(body) = serde_json::to_vec(&entry) {
            if tokio::fs::write(dir.join(&name), body).await.is_ok() {
                keep.insert(name);
            }
        }
    }
    let Ok(mut read) = tokio::fs::read_dir(dir).await else {
        return;
    };
    while let Ok(Some(file)) = read.next_entry().await {
        let name = file.file_name();
        if !keep.contains(name.to_string_lossy().as_ref()) {
            let _ = tokio::fs::remove_file(file.path()).await;
        }
    }
}

/// The filtering proxy core.
pub struct Filter {
    config: RwLock<FilterConfig>,
    store: Arc<RuleStore>,
    lookup: Arc<LookupCache>,
    responses: Arc<ResponseCache>,
    interfaces: Arc<InterfaceManager>,
    manager: Arc<RuleManager>,
    pipeline: Arc<QueryPipeline>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

fn pipeline_config(config: &FilterConfig) -> PipelineConfig {
    PipelineConfig {
        sinkhole_v4: config.sinkhole_v4,
        sinkhole_v6: config.sinkhole_v6,
        blocked_ttl: config.blocked_ttl,
        wildcard_mode: config.wildcard_mode,
        enable_reserved_actions: config.enable_reserved_actions,
        transition_queue_depth: config.transition_queue_depth,
    }
}

/// A Builder for Filter.
pub struct FilterBuilder {
    config: FilterConfig,
    credentials: Arc<dyn CredentialStore>,
}

impl FilterBuilder {
    /// Create a FilterBuilder over a configuration, with no credential
    /// store (sources requiring auth will fail).
    pub fn new(config: FilterConfig) -> Self {
        Self {
            config,
            credentials: Arc::new(NoCredentials),
        }
    }

    /// Resolve fetcher credential handles through `credentials`.
    pub fn with_credentials(mut self, credentials: Arc<dyn CredentialStore>) -> Self {
        self.credentials = credentials;
        self
    }
}

#[async_trait]
impl AsyncTryInto<Arc<Filter>> for FilterBuilder {
    type Error = FilterError;

    /// Build every component from the configuration, check its validity,
    /// and start serving.
    async fn async_try_into(self) -> Result<Arc<Filter>> {
        Filter::assemble(self.config, self.credentials).await
    }
}

impl Filter {
    /// Start with defaults; shorthand for the [`FilterBuilder`] chain.
    pub async fn start(config: FilterConfig) -> Result<Arc<Self>> {
        FilterBuilder::new(config).async_try_into().await
    }

    async fn assemble(
        config: FilterConfig,
        credentials: Arc<dyn CredentialStore>,
    ) -> Result<Arc<Self>> {
        config.validate()?;

        let store = if config.db_path.as_os_str() == ":memory:" {
            Arc::new(RuleStore::open_in_memory().await?)
        } else {
            if let Some(parent) = config.db_path.parent() {
                tokio::fs::create_dir_all(parent).await.ok();
            }
            Arc::new(RuleStore::open(&config.db_path).await?)
        };
        let lookup = Arc::new(LookupCache::new(
            config.lookup_cache.capacity,
            Duration::from_secs(config.lookup_cache.ttl),
        ));
        let responses = Arc::new(ResponseCache::new(
            config.cache.max_memory_cache_size,
            config.cache.default_ttl,
            Duration::from_millis(config.cache.slow_lookup_threshold_ms),
        ));
        let interfaces = Arc::new(InterfaceManager::new(
            config.bind_strategy,
            &config.vpn_resolvers,
            config.vpn_device.clone(),
            config.default_device.clone(),
        )?);

        let addrs = config.resolver_addrs()?;
        let devices = if config.enable_dns_chain_preservation {
            interfaces.device_map(&addrs)
        } else {
            Default::default()
        };
        let upstreams = Arc::new(Upstreams::new(
            &addrs,
            &devices,
            Duration::from_secs(config.dns_timeout),
            config.tcp_fallback,
        )?);
        let retry = Arc::new(RetryManager::new(
            config.update.max_retries,
            Duration::from_millis(config.update.retry_delay_ms),
            Duration::from_millis(config.update.retry_ceiling_ms),
            0.2,
        ));

        let mut context = EvaluationContext::default();
        context.vpn_connected = interfaces.vpn_active();
        let manager = RuleManager::start(
            config.clone(),
            store.clone(),
            lookup.clone(),
            credentials,
            context,
        )
        .await?;

        let pipeline = Arc::new(QueryPipeline::new(
            store.clone(),
            lookup.clone(),
            responses.clone(),
            upstreams,
            interfaces.clone(),
            retry,
            pipeline_config(&config),
        ));

        let filter = Arc::new(Self {
            store,
            lookup,
            responses,
            interfaces,
            manager,
            pipeline,
            tasks: Mutex::new(Vec::new()),
            config: RwLock::new(config),
        });
        {
            let config = filter.config.read().unwrap().clone();
            if config.cache.persist_cache {
                load_persisted_responses(&response_cache_dir(&config), &filter.responses).await;
            }
        }
        Self::spawn_event_bridge(&filter);
        Self::spawn_cleanup(&filter);
        info!("dshield filtering core running");
        Ok(filter)
    }

    // Reload and cache events from the manager drive the pipeline's
    // transition gate and the response cache.
    fn spawn_event_bridge(this: &Arc<Self>) {
        let filter = this.clone();
        let mut events = this.manager.subscribe_events();
        let task = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(RulesEvent::ReloadStarted) => filter.pipeline.enter_transition(),
                    Ok(RulesEvent::ReloadFinished) => filter.pipeline.leave_transition(),
                    Ok(RulesEvent::CachesCleared) => filter.responses.clear(),
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!("event bridge lagged by {} events", n);
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                }
            }
        });
        this.tasks.lock().unwrap().push(task);
    }

    // Periodic expiry sweeps for both caches, expired rules, and stale
    // interface bindings.
    fn spawn_cleanup(this: &Arc<Self>) {
        let filter = this.clone();
        let (every, persist_dir) = {
            let config = this.config.read().unwrap();
            (
                Duration::from_secs(config.cache.cleanup_interval.max(1)),
                config
                    .cache
                    .persist_cache
                    .then(|| response_cache_dir(&config)),
            )
        };
        let task = tokio::spawn(async move {
            loop {
                tokio::time::sleep(every).await;
                filter.responses.remove_expired();
                filter.interfaces.sweep_expired();
                if let Err(e) = filter.store.remove_expired().await {
                    warn!("expired-rule sweep failed: {}", e);
                }
                if let Some(dir) = &persist_dir {
                    persist_responses(dir, &filter.responses).await;
                }
            }
        });
        this.tasks.lock().unwrap().push(task);
    }

    /// Handle one client datagram.
    pub async fn handle(&self, payload: Bytes, flow: &FlowHandle) -> Option<Bytes> {
        self.pipeline.handle(payload, flow).await
    }

    /// Hot-reload a new configuration. Queries arriving meanwhile park on
    /// the transition queue.
    pub async fn reload(&self, config: FilterConfig) -> Result<()> {
        config.validate()?;
        *self.config.write().unwrap() = config.clone();
        let result = self.manager.reload(config).await;
        self.responses.clear();
        result
    }

    /// Feed a VPN path transition from the host's path monitor.
    pub fn set_vpn_state(&self, up: bool) -> Result<()> {
        if self.interfaces.set_vpn_state(up).is_none() {
            return Ok(());
        }
        // Split-horizon answers may differ across the path change.
        self.responses.clear();
        let config = self.config.read().unwrap().clone();
        let addrs = config.resolver_addrs()?;
        let devices = if config.enable_dns_chain_preservation {
            self.interfaces.device_map(&addrs)
        } else {
            Default::default()
        };
        self.pipeline.set_upstreams(Arc::new(Upstreams::new(
            &addrs,
            &devices,
            Duration::from_secs(config.dns_timeout),
            config.tcp_fallback,
        )?));
        if config.update.update_on_network_change {
            self.manager.update_all(UpdatePriority::High);
        }
        Ok(())
    }

    /// Drop the response cache and all cached rule verdicts.
    pub fn clear_caches(&self) {
        self.responses.clear();
        self.manager.clear_caches();
    }

    /// Refresh every rule source now.
    pub fn update_now(&self) {
        self.manager.update_all(UpdatePriority::High);
    }

    /// Refresh one source now; false when it is unknown or rate-limited.
    pub fn update_source_now(&self, source: &str) -> bool {
        self.manager
            .scheduler()
            .trigger(source, UpdatePriority::High)
    }

    /// The rule manager, for inspection.
    pub fn manager(&self) -> &RuleManager {
        &self.manager
    }

    /// A structured status snapshot for the control surface.
    pub async fn status(&self) -> StatusSnapshot {
        let cache = self.responses.stats();
        let lookup = self.lookup.stats();
        let sched = self.manager.scheduler().stats();
        let rules_by_source: BTreeMap<String, u64> = self
            .manager
            .rule_counts()
            .await
            .unwrap_or_default()
            .into_iter()
            .collect();
        let last_updates = self
            .manager
            .recent_results()
            .into_iter()
            .map(|r| {
                (
                    r.source.to_string(),
                    LastUpdate {
                        success: r.success,
                        timestamp: r.timestamp.to_rfc3339(),
                        rule_count: r.rule_count,
                        error: r.error,
                        recovery_suggestion: r.recovery_suggestion,
                    },
                )
            })
            .collect();

        StatusSnapshot {
            state: format!("{:?}", self.manager.state()),
            total_rules: rules_by_source.values().sum(),
            rules_by_source,
            last_updates,
            response_cache: ResponseCacheStatus {
                hits: cache.hits,
                misses: cache.misses,
                evictions: cache.evictions,
                hit_rate: cache.hit_rate,
                entries: cache.entries,
                slow_lookups: cache.slow_lookups,
                average_lookup_us: cache.average_lookup.map(|d| d.as_micros() as u64),
            },
            lookup_cache: LookupCacheStatus {
                hits: lookup.hits(),
                negative_hits: lookup.negative_hits(),
                misses: lookup.misses(),
                invalidations: lookup.invalidations(),
            },
            scheduler: SchedulerStatus {
                scheduled: sched.scheduled,
                completed: sched.completed,
                failed: sched.failed,
            },
            vpn_active: self.interfaces.vpn_active(),
        }
    }

    /// Whether the core is in a healthy state.
    pub fn healthy(&self) -> bool {
        matches!(
            self.manager.state(),
            ManagerState::Running | ManagerState::Starting
        )
    }

    /// Stop scheduling and background tasks.
    pub fn shutdown(&self) {
        self.manager.stop();
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
        info!("dshield filtering core stopped");
    }
}

impl Drop for Filter {
    fn drop(&mut self) {
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
    }
}

/// Point-in-time state of one source's last update.
#[derive(Clone, Debug, Serialize)]
pub struct LastUpdate {
    /// Whether it committed rules.
    pub success: bool,
    /// RFC3339 completion time.
    pub timestamp: String,
    /// Rules committed.
    pub rule_count: usize,
    /// Error description on failure.
    pub error: Option<String>,
    /// Recovery hint on failure.
    pub recovery_suggestion: Option<String>,
}

/// Response cache counters for the control surface.
#[derive(Clone, Debug, Serialize)]
pub struct ResponseCacheStatus {
    /// Served from cache.
    pub hits: u64,
    /// Cache misses.
    pub misses: u64,
    /// Budget evictions.
    pub evictions: u64,
    /// hits / lookups.
    pub hit_rate: f64,
    /// Entries currently cached.
    pub entries: usize,
    /// Lookups above the slow threshold.
    pub slow_lookups: u64,
    /// Mean lookup time in microseconds.
    pub average_lookup_us: Option<u64>,
}

/// Verdict cache counters for the control surface.
#[derive(Clone, Debug, Serialize)]
pub struct LookupCacheStatus {
    /// Positive hits.
    pub hits: u64,
    /// Negative ("no rule") hits.
    pub negative_hits: u64,
    /// Misses that went to the store.
    pub misses: u64,
    /// Full invalidations.
    pub invalidations: u64,
}

/// Scheduler counters for the control surface.
#[derive(Clone, Debug, Serialize)]
pub struct SchedulerStatus {
    /// Tasks enqueued.
    pub scheduled: u64,
    /// Tasks completed.
    pub completed: u64,
    /// Tasks failed.
    pub failed: u64,
}

/// Everything `get-status` reports.
#[derive(Clone, Debug, Serialize)]
pub struct StatusSnapshot {
    /// Manager state name.
    pub state: String,
    /// Stored rules across sources.
    pub total_rules: u64,
    /// Rules per source.
    pub rules_by_source: BTreeMap<String, u64>,
    /// Latest update outcomes per source.
    pub last_updates: BTreeMap<String, LastUpdate>,
    /// Response cache counters.
    pub response_cache: ResponseCacheStatus,
    /// Verdict cache counters.
    pub lookup_cache: LookupCacheStatus,
    /// Scheduler counters.
    pub scheduler: SchedulerStatus,
    /// Whether a VPN path is active.
    pub vpn_active: bool,
}
