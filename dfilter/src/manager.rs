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

//! The rule manager: orchestrates manifest resolution, fetchers, parsers,
//! the rule store, and cache invalidation, driven by the update scheduler.
//!
//! Source replacement is transactional; a failed update leaves the previous
//! rules serving. The manager only reaches its Error state when every source
//! is failing or the configuration itself is unusable.

use crate::{
    config::FilterConfig,
    error::{FilterError, Result},
    fetch::{CredentialStore, FetchError, FileFetcher, HttpsFetcher, RuleFetch},
    manifest::{
        EvaluationContext, ManagedRules, Manifest, ManifestResolver, RuleSourceConfig, SourceKind,
    },
    rules::{
        lookup_cache::LookupCache,
        parsers::{self, ParseOptions},
        store::RuleStore,
        Provenance, Rule, RuleAction,
    },
    sched::{UpdatePriority, UpdateScheduler},
    Label,
};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use log::{error, info, warn};
use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{Arc, Mutex, RwLock},
    time::{Duration, Instant},
};
use tokio::sync::{broadcast, watch};

const RESULT_HISTORY: usize = 64;
// Synthetic source id carrying a manifest's inline managed rules.
const MANAGED_SOURCE: &str = "manifest:managed";

/// Manager lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ManagerState {
    /// Not started.
    Stopped,
    /// Loading configuration and resolving manifests.
    Starting,
    /// Serving and refreshing rules.
    Running,
    /// Shutting down.
    Stopping,
    /// Configuration is unusable or every source is failing.
    Error,
}

/// Change notifications published to the rest of the system.
#[derive(Clone, Debug)]
pub enum RulesEvent {
    /// A source committed new rules.
    Updated {
        /// The source that changed.
        source: Label,
        /// Rules now attributed to it.
        rule_count: usize,
    },
    /// A source update failed; previous rules remain in effect.
    UpdateFailed {
        /// The source that failed.
        source: Label,
        /// Error description.
        error: String,
    },
    /// A configuration reload began; pipelines enter transition mode.
    ReloadStarted,
    /// The reload finished; pipelines drain their transition queues.
    ReloadFinished,
    /// Caches were cleared on request.
    CachesCleared,
}

/// The record of one source update, kept for inspection.
#[derive(Clone, Debug)]
pub struct RuleUpdateResult {
    /// The source updated.
    pub source: Label,
    /// Whether new rules were committed.
    pub success: bool,
    /// Error description on failure.
    pub error: Option<String>,
    /// Recovery hint for user-visible surfaces.
    pub recovery_suggestion: Option<String>,
    /// True when the update was skipped and cached/stored rules serve on.
    pub from_cache: bool,
    /// When the update finished.
    pub timestamp: DateTime<Utc>,
    /// Time spent fetching.
    pub fetch_duration: Duration,
    /// Time spent parsing.
    pub parse_duration: Duration,
    /// Rules committed.
    pub rule_count: usize,
}

impl RuleUpdateResult {
    fn failure(source: &str, error: String, suggestion: Option<&'static str>) -> Self {
        Self {
            source: Label::from(source),
            success: false,
            error: Some(error),
            recovery_suggestion: suggestion.map(str::to_string),
            from_cache: false,
            timestamp: Utc::now(),
            fetch_duration: Duration::ZERO,
            parse_duration: Duration::ZERO,
            rule_count: 0,
        }
    }
}

/// Top-level orchestrator for the rule control plane.
pub struct RuleManager {
    config: RwLock<FilterConfig>,
    store: Arc<RuleStore>,
    lookup: Arc<LookupCache>,
    scheduler: Arc<UpdateScheduler>,
    credentials: Arc<dyn CredentialStore>,
    context: EvaluationContext,
    sources: RwLock<HashMap<Label, RuleSourceConfig>>,
    state: watch::Sender<ManagerState>,
    events: broadcast::Sender<RulesEvent>,
    results: Mutex<VecDeque<RuleUpdateResult>>,
    last_by_source: Mutex<HashMap<Label, RuleUpdateResult>>,
    slots: Mutex<HashSet<Label>>,
}

impl RuleManager {
    /// Build and start the manager: resolve the manifest when configured,
    /// register sources with the scheduler, and begin consuming dispatched
    /// updates. Optionally kicks off `update_on_start` refreshes.
    pub async fn start(
        config: FilterConfig,
        store: Arc<RuleStore>,
        lookup: Arc<LookupCache>,
        credentials: Arc<dyn CredentialStore>,
        context: EvaluationContext,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let (state, _) = watch::channel(ManagerState::Starting);
        let (events, _) = broadcast::channel(64);
        let (scheduler, mut grants) =
            UpdateScheduler::new(config.update.max_concurrent_updates);

        let manager = Arc::new(Self {
            store,
            lookup,
            scheduler: Arc::new(scheduler),
            credentials,
            context,
            sources: RwLock::new(HashMap::new()),
            state,
            events,
            results: Mutex::new(VecDeque::new()),
            last_by_source: Mutex::new(HashMap::new()),
            slots: Mutex::new(HashSet::new()),
            config: RwLock::new(config),
        });

        manager.load_sources().await?;
        manager.scheduler.start();
        if manager.state() != ManagerState::Error {
            manager.state.send_replace(ManagerState::Running);
        }

        {
            let manager = manager.clone();
            tokio::spawn(async move {
                while let Some(grant) = grants.recv().await {
                    let started = Instant::now();
                    let result = manager.update_source(&grant.task.source).await;
                    manager.scheduler.record_completion(
                        &grant.task.source,
                        result.success,
                        started.elapsed(),
                    );
                    drop(grant);
                }
            });
        }

        let update_on_start = manager.config.read().unwrap().update.update_on_start;
        if update_on_start {
            manager.update_all(UpdatePriority::High);
        }
        Ok(manager)
    }

    /// Current state.
    pub fn state(&self) -> ManagerState {
        *self.state.borrow()
    }

    /// Observe state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<ManagerState> {
        self.state.subscribe()
    }

    /// Observe rule change events.
    pub fn subscribe_events(&self) -> broadcast::Receiver<RulesEvent> {
        self.events.subscribe()
    }

    /// The scheduler, for pause/resume and control triggers.
    pub fn scheduler(&self) -> &UpdateScheduler {
        &self.scheduler
    }

    /// Registered sources.
    pub fn sources(&self) -> Vec<RuleSourceConfig> {
        self.sources.read().unwrap().values().cloned().collect()
    }

    fn emit(&self, event: RulesEvent) {
        let _ = self.events.send(event);
    }

    // Resolve the effective source list (manifest or static) and register
    // everything enabled with the scheduler.
    async fn load_sources(&self) -> Result<()> {
        let config = self.config.read().unwrap().clone();
        let mut effective: Vec<RuleSourceConfig>;

        if config.manifest.enabled {
            let resolver = self.manifest_resolver(&config).await?;
            let chain = ManifestResolver::identifier_chain(
                config.manifest.identifier.as_deref(),
                config.device_serial.as_deref(),
            );
            match resolver.resolve_with_fallback(&chain).await {
                Ok(resolved) => {
                    for warning in &resolved.warnings {
                        warn!("manifest warning: {}", warning);
                    }
                    self.apply_managed_rules(&resolved.managed_rules).await?;
                    effective = resolved.rule_sources;
                }
                Err(e) => {
                    // Previously stored rules keep serving.
                    error!("manifest resolution failed: {}", e);
                    self.state.send_replace(ManagerState::Error);
                    effective = Vec::new();
                }
            }
            effective.extend(config.rule_sources.iter().cloned());
        } else {
            effective = config.rule_sources.clone();
        }

        let mut sources = self.sources.write().unwrap();
        for stale in sources.keys() {
            self.scheduler.remove_source(stale);
        }
        sources.clear();
        for source in effective {
            if !source.enabled {
                info!("source '{}' disabled, not scheduling", source.identifier);
                continue;
            }
            let strategy = config.update.strategy_for(Some(source.update_interval))?;
            self.scheduler
                .register_source(source.identifier.clone(), strategy);
            sources.insert(source.identifier.clone(), source);
        }
        Ok(())
    }

    // A resolver whose search paths include the mirror directory for a
    // remote manifest, freshly mirrored when reachable.
    async fn manifest_resolver(&self, config: &FilterConfig) -> Result<ManifestResolver> {
        let mut search_paths = config.manifest.search_paths.clone();
        let mirror_dir = config.cache.cache_directory.join("manifests");

        if let Some(url) = &config.manifest.url {
            if config.offline_mode {
                info!("offline: skipping remote manifest fetch");
            } else {
                match self.mirror_remote_manifest(config, url, &mirror_dir).await {
                    Ok(id) => info!("mirrored remote manifest '{}'", id),
                    Err(e) => warn!(
                        "remote manifest fetch failed, falling back to cache: {}",
                        e
                    ),
                }
            }
            search_paths.push(mirror_dir);
        }

        let ttl = ChronoDuration::seconds(
            config.manifest.cache_ttl.unwrap_or(3600) as i64
        );
        Ok(ManifestResolver::new(search_paths, self.context.clone()).with_cache(
            config.cache.cache_directory.join("manifest-cache"),
            ttl,
            config.manifest.allow_expired.unwrap_or(true),
        ))
    }

    async fn mirror_remote_manifest(
        &self,
        config: &FilterConfig,
        url: &str,
        mirror_dir: &std::path::Path,
    ) -> Result<String> {
        let mut descriptor = RuleSourceConfig {
            identifier: "manifest".into(),
            name: None,
            kind: SourceKind::Https,
            format: None,
            url: Some(url.to_string()),
            path: None,
            update_interval: config.manifest.update_interval.unwrap_or(3600),
            priority: 0,
            enabled: true,
            auth: None,
            headers: config.additional_http_headers.clone().into_iter().collect(),
            pinned_cert_hashes: Vec::new(),
            accepted_statuses: Vec::new(),
            max_redirects: 5,
            allow_insecure_http: false,
            watch: false,
        };
        descriptor.validate()?;

        let fetcher = HttpsFetcher::new(
            &descriptor,
            self.credentials.clone(),
            Duration::from_secs(config.update.fetch_timeout),
            config.max_payload_bytes,
        )?;
        let data = fetcher.fetch(None).await?;
        let manifest = Manifest::from_slice(&data, Some(url))?;

        tokio::fs::create_dir_all(mirror_dir).await.map_err(|e| {
            FilterError::Manifest(crate::manifest::ManifestError::Io(e))
        })?;
        let path = mirror_dir.join(format!("{}.json", manifest.identifier));
        let body = serde_json::to_vec_pretty(&manifest)
            .map_err(|e| FilterError::Manifest(crate::manifest::ManifestError::InvalidFormat(e.to_string())))?;
        tokio::fs::write(&path, body)
            .await
            .map_err(|e| FilterError::Manifest(crate::manifest::ManifestError::Io(e)))?;
        Ok(manifest.identifier)
    }

    // Inline manifest rules land in the store as their own synthetic source.
    async fn apply_managed_rules(&self, managed: &ManagedRules) -> Result<()> {
        let mut rules = Vec::with_capacity(managed.block.len() + managed.allow.len());
        for (list, action) in [
            (&managed.block, RuleAction::Block),
            (&managed.allow, RuleAction::Allow),
        ] {
            for pattern in list {
                match Rule::new(pattern, action, Provenance::Manifest) {
                    Ok(rule) => rules.push(rule),
                    Err(e) => warn!("skipping managed rule: {}", e),
                }
            }
        }
        self.store.replace_source(MANAGED_SOURCE, &rules).await?;
        self.lookup.invalidate();
        self.emit(RulesEvent::Updated {
            source: Label::from(MANAGED_SOURCE),
            rule_count: rules.len(),
        });
        Ok(())
    }

    /// Request refreshes of every registered source.
    pub fn update_all(&self, priority: UpdatePriority) {
        let ids: Vec<Label> = self.sources.read().unwrap().keys().cloned().collect();
        for id in ids {
            self.scheduler.trigger(&id, priority);
        }
    }

    /// Run one source update to completion and record the result. Concurrent
    /// updates for the same source are rejected.
    pub async fn update_source(&self, id: &str) -> RuleUpdateResult {
        let label = Label::from(id);
        let Some(source) = self.sources.read().unwrap().get(&label).cloned() else {
            return self.finish(RuleUpdateResult::failure(
                id,
                format!("unknown source '{}'", id),
                None,
            ));
        };
        if !self.slots.lock().unwrap().insert(label.clone()) {
            return RuleUpdateResult::failure(
                id,
                "update already in progress".into(),
                None,
            );
        }
        let result = self.run_update(&source).await;
        self.slots.lock().unwrap().remove(&label);
        self.finish(result)
    }

    async fn run_update(&self, source: &RuleSourceConfig) -> RuleUpdateResult {
        let config = self.config.read().unwrap().clone();
        let id = source.identifier.as_str();

        if config.offline_mode && source.kind == SourceKind::Https {
            info!("offline: keeping stored rules for '{}'", id);
            return RuleUpdateResult {
                source: source.identifier.clone(),
                success: true,
                error: None,
                recovery_suggestion: None,
                from_cache: true,
                timestamp: Utc::now(),
                fetch_duration: Duration::ZERO,
                parse_duration: Duration::ZERO,
                rule_count: 0,
            };
        }

        // Fetch, timed.
        let fetch_started = Instant::now();
        let fetched = match self.fetch_source(&config, source).await {
            Ok(data) => data,
            Err(e) => {
                let suggestion = e.recovery_suggestion();
                let result = RuleUpdateResult::failure(id, e.to_string(), Some(suggestion));
                self.emit(RulesEvent::UpdateFailed {
                    source: source.identifier.clone(),
                    error: result.error.clone().unwrap_or_default(),
                });
                return result;
            }
        };
        let fetch_duration = fetch_started.elapsed();

        if fetched.len() as u64 > config.max_payload_bytes {
            return RuleUpdateResult::failure(
                id,
                format!("payload of {} bytes exceeds configured maximum", fetched.len()),
                Some("Raise the size cap or use a smaller list"),
            );
        }

        // Parse, timed.
        let parse_started = Instant::now();
        let hint = source
            .path
            .as_ref()
            .and_then(|p| p.to_str())
            .or(source.url.as_deref());
        let format = parsers::detect_format(source.format, hint, &fetched);
        let options = ParseOptions {
            strict: config.strict_parsing,
            provenance: Provenance::Remote,
        };
        let set = match parsers::parse(&fetched, format, options) {
            Ok(set) => set,
            Err(e) => {
                let result = RuleUpdateResult::failure(
                    id,
                    e.to_string(),
                    Some("The source may be serving a broken list"),
                );
                self.emit(RulesEvent::UpdateFailed {
                    source: source.identifier.clone(),
                    error: result.error.clone().unwrap_or_default(),
                });
                return result;
            }
        };
        let parse_duration = parse_started.elapsed();

        if set.rules().len() < config.min_rule_count {
            return RuleUpdateResult::failure(
                id,
                format!(
                    "list has {} rules, below the configured minimum of {}",
                    set.rules().len(),
                    config.min_rule_count
                ),
                Some("The source may be serving a broken list"),
            );
        }
        if set.stats().invalid_rules > 0 {
            warn!(
                "source '{}': skipped {} invalid entries",
                id,
                set.stats().invalid_rules
            );
        }

        // Replace transactionally, then drop cached verdicts.
        if let Err(e) = self.store.replace_source(id, set.rules()).await {
            return RuleUpdateResult::failure(
                id,
                e.to_string(),
                Some("Check the rule database file"),
            );
        }
        self.lookup.invalidate();

        let rule_count = set.rules().len();
        info!(
            "source '{}' updated: {} rules (fetch {:?}, parse {:?})",
            id, rule_count, fetch_duration, parse_duration
        );
        self.emit(RulesEvent::Updated {
            source: source.identifier.clone(),
            rule_count,
        });

        RuleUpdateResult {
            source: source.identifier.clone(),
            success: true,
            error: None,
            recovery_suggestion: None,
            from_cache: false,
            timestamp: Utc::now(),
            fetch_duration,
            parse_duration,
            rule_count,
        }
    }

    async fn fetch_source(
        &self,
        config: &FilterConfig,
        source: &RuleSourceConfig,
    ) -> std::result::Result<bytes::Bytes, FetchError> {
        match source.kind {
            SourceKind::Https => {
                let mut descriptor = source.clone();
                for (k, v) in &config.additional_http_headers {
                    descriptor
                        .headers
                        .entry(k.clone())
                        .or_insert_with(|| v.clone());
                }
                let fetcher = HttpsFetcher::new(
                    &descriptor,
                    self.credentials.clone(),
                    Duration::from_secs(config.update.fetch_timeout),
                    config.max_payload_bytes,
                )?;
                fetcher.fetch(None).await
            }
            SourceKind::File => {
                let path = source
                    .path
                    .clone()
                    .ok_or_else(|| FetchError::InvalidUrl("file source without path".into()))?;
                FileFetcher::new(path, config.max_payload_bytes)
                    .fetch(None)
                    .await
            }
        }
    }

    // Record a result, maintain the error-state invariant, return it.
    fn finish(&self, result: RuleUpdateResult) -> RuleUpdateResult {
        {
            let mut results = self.results.lock().unwrap();
            results.push_back(result.clone());
            while results.len() > RESULT_HISTORY {
                results.pop_front();
            }
        }
        self.last_by_source
            .lock()
            .unwrap()
            .insert(result.source.clone(), result.clone());

        // Error only when every source's latest outcome is a failure.
        let sources = self.sources.read().unwrap();
        let last = self.last_by_source.lock().unwrap();
        let all_failed = !sources.is_empty()
            && sources.keys().all(|id| {
                last.get(id).map(|r| !r.success).unwrap_or(false)
            });
        drop(last);
        drop(sources);
        if all_failed {
            warn!("all rule sources failing; previous rules remain in effect");
            self.state.send_replace(ManagerState::Error);
        } else if self.state() == ManagerState::Error {
            self.state.send_replace(ManagerState::Running);
        }
        result
    }

    /// Recent update results, newest last.
    pub fn recent_results(&self) -> Vec<RuleUpdateResult> {
        self.results.lock().unwrap().iter().cloned().collect()
    }

    /// The latest result for one source.
    pub fn last_result(&self, source: &str) -> Option<RuleUpdateResult> {
        self.last_by_source.lock().unwrap().get(source).cloned()
    }

    /// Per-source rule counts from the store.
    pub async fn rule_counts(&self) -> Result<Vec<(String, u64)>> {
        Ok(self.store.counts_by_source().await?)
    }

    /// Total stored rules.
    pub async fn total_rules(&self) -> Result<u64> {
        Ok(self.store.rule_count().await?)
    }

    /// Drop cached verdicts (the response cache is owned by the pipeline and
    /// cleared by the caller alongside this).
    pub fn clear_caches(&self) {
        self.lookup.invalidate();
        self.emit(RulesEvent::CachesCleared);
    }

    /// Announce a configuration reload window to the pipelines.
    pub fn begin_reload(&self) {
        self.emit(RulesEvent::ReloadStarted);
    }

    /// Re-resolve sources after a configuration change and end the reload
    /// window.
    pub async fn reload(&self, config: FilterConfig) -> Result<()> {
        config.validate()?;
        self.emit(RulesEvent::ReloadStarted);
        *self.config.write().unwrap() = config;
        let result = self.load_sources().await;
        self.lookup.invalidate();
        self.emit(RulesEvent::ReloadFinished);
        result
    }

    /// Stop scheduling and mark the manager stopped.
    pub fn stop(&self) {
        self.state.send_replace(ManagerState::Stopping);
        self.scheduler.stop();
        self.state.send_replace(ManagerState::Stopped);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::NoCredentials;
    use std::io::Write;
    use tempfile::TempDir;

    fn file_source(id: &str, path: std::path::PathBuf) -> RuleSourceConfig {
        RuleSourceConfig {
            identifier: Label::from(id),
            name: None,
            kind: SourceKind::File,
            format: None,
            url: None,
            path: Some(path),
            update_interval: 3600,
            priority: 0,
            enabled: true,
            auth: None,
            headers: Default::default(),
            pinned_cert_hashes: Vec::new(),
            accepted_statuses: Vec::new(),
            max_redirects: 5,
            allow_insecure_http: false,
            watch: false,
        }
    }

    async fn manager_with(config: FilterConfig) -> Arc<RuleManager> {
        let store = Arc::new(RuleStore::open_in_memory().await.unwrap());
        let lookup = Arc::new(LookupCache::default());
        RuleManager::start(
            config,
            store,
            lookup,
            Arc::new(NoCredentials),
            EvaluationContext::default(),
        )
        .await
        .unwrap()
    }

    fn config_with_sources(sources: Vec<RuleSourceConfig>) -> FilterConfig {
        let mut config = FilterConfig::default();
        config.rule_sources = sources;
        config.update.update_on_start = false;
        config
    }

    #[tokio::test]
    async fn file_source_update_commits_rules() {
        let dir = TempDir::new().unwrap();
        let list = dir.path().join("ads.hosts");
        std::fs::write(&list, "0.0.0.0 ads.example.com\n0.0.0.0 track.example.com\n").unwrap();

        let manager = manager_with(config_with_sources(vec![file_source("ads", list)])).await;
        assert_eq!(manager.state(), ManagerState::Running);

        let result = manager.update_source("ads").await;
        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.rule_count, 2);
        assert_eq!(manager.total_rules().await.unwrap(), 2);

        // Replacement, not accumulation.
        std::fs::write(
            manager.sources()[0].path.clone().unwrap(),
            "0.0.0.0 only-one.example.com\n",
        )
        .unwrap();
        let result = manager.update_source("ads").await;
        assert!(result.success);
        assert_eq!(manager.total_rules().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn failed_update_keeps_previous_rules() {
        let dir = TempDir::new().unwrap();
        let list = dir.path().join("ads.hosts");
        std::fs::write(&list, "0.0.0.0 ads.example.com\n").unwrap();

        let manager =
            manager_with(config_with_sources(vec![file_source("ads", list.clone())])).await;
        assert!(manager.update_source("ads").await.success);

        std::fs::remove_file(&list).unwrap();
        let result = manager.update_source("ads").await;
        assert!(!result.success);
        assert_eq!(
            result.recovery_suggestion.as_deref(),
            Some("Check that the rule list file exists")
        );
        // Previous rules still serve; the only source failing is Error state.
        assert_eq!(manager.total_rules().await.unwrap(), 1);
        assert_eq!(manager.state(), ManagerState::Error);

        // Recovery brings it back.
        std::fs::write(&list, "0.0.0.0 ads.example.com\n").unwrap();
        assert!(manager.update_source("ads").await.success);
        assert_eq!(manager.state(), ManagerState::Running);
    }

    #[tokio::test]
    async fn minimum_rule_count_validation() {
        let dir = TempDir::new().unwrap();
        let list = dir.path().join("empty.hosts");
        std::fs::write(&list, "# nothing here\n").unwrap();

        let mut config = config_with_sources(vec![file_source("empty", list)]);
        config.min_rule_count = 1;
        let manager = manager_with(config).await;

        let result = manager.update_source("empty").await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("below the configured minimum"));
    }

    #[tokio::test]
    async fn offline_mode_skips_https_sources() {
        let mut https = file_source("remote", std::path::PathBuf::from("/unused"));
        https.kind = SourceKind::Https;
        https.path = None;
        https.url = Some("https://lists.example.com/ads.json".into());

        let mut config = config_with_sources(vec![https]);
        config.offline_mode = true;
        let manager = manager_with(config).await;

        let result = manager.update_source("remote").await;
        assert!(result.success);
        assert!(result.from_cache);
    }

    #[tokio::test]
    async fn manifest_managed_rules_apply_on_start() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("default.json"),
            r#"{"identifier": "default",
                "managed_rules": {"block": ["bad.example.com"], "allow": ["ok.example.com"]}}"#,
        )
        .unwrap();

        let mut config = FilterConfig::default();
        config.update.update_on_start = false;
        config.manifest.enabled = true;
        config.manifest.search_paths = vec![dir.path().to_path_buf()];
        config.cache.cache_directory = dir.path().join("cache");

        let manager = manager_with(config).await;
        assert_eq!(manager.state(), ManagerState::Running);
        assert_eq!(manager.total_rules().await.unwrap(), 2);
        let counts = manager.rule_counts().await.unwrap();
        assert_eq!(counts, vec![(MANAGED_SOURCE.to_string(), 2)]);
    }

    #[tokio::test]
    async fn unknown_source_is_a_recorded_failure() {
        let manager = manager_with(config_with_sources(vec![])).await;
        let result = manager.update_source("ghost").await;
        assert!(!result.success);
        assert!(manager.last_result("ghost").is_some());
    }

    #[tokio::test]
    async fn events_are_published() {
        let dir = TempDir::new().unwrap();
        let list = dir.path().join("l.hosts");
        std::fs::write(&list, "0.0.0.0 ads.example.com\n").unwrap();
        let manager = manager_with(config_with_sources(vec![file_source("l", list)])).await;

        let mut events = manager.subscribe_events();
        assert!(manager.update_source("l").await.success);
        match events.recv().await.unwrap() {
            RulesEvent::Updated { source, rule_count } => {
                assert_eq!(source, "l");
                assert_eq!(rule_count, 1);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }
}
