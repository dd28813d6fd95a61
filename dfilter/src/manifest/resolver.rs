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

//! Resolution of manifest hierarchies.
//!
//! Iterative depth-first expansion of `included_manifests` with an on-path
//! set for cycle detection, predicate evaluation for conditional items, and
//! a TTL'd on-disk cache with an allow-expired degradation path.

use super::{
    predicate, EvaluationContext, ManagedRules, Manifest, ManifestError, Result, RuleSourceConfig,
};
use chrono::{DateTime, Duration, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::{
    collections::{HashMap, HashSet},
    path::PathBuf,
};
use tokio::fs;

const MANIFEST_EXTENSIONS: [&str; 5] = ["json", "yaml", "yml", "plist", ""];

/// The flattened product of resolving one manifest hierarchy.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ResolvedManifest {
    /// Identifier the resolution started from.
    pub primary: String,
    /// Manifest identifiers in resolution (merge) order; the primary last.
    pub chain: Vec<String>,
    /// Merged rule sources, conflicts resolved.
    pub rule_sources: Vec<RuleSourceConfig>,
    /// Merged inline rules.
    pub managed_rules: ManagedRules,
    /// When the resolution happened.
    pub resolved_at: DateTime<Utc>,
    /// Non-fatal findings (duplicate sources, skipped conditions, ...).
    pub warnings: Vec<String>,
    /// True when any manifest came from an expired cache entry.
    pub stale: bool,
}

#[derive(Serialize, Deserialize)]
struct CacheEnvelope {
    cached_at: DateTime<Utc>,
    manifest: Manifest,
}

/// Resolves manifests from search paths with an optional disk cache.
pub struct ManifestResolver {
    search_paths: Vec<PathBuf>,
    cache_dir: Option<PathBuf>,
    cache_ttl: Duration,
    allow_expired: bool,
    context: EvaluationContext,
}

impl ManifestResolver {
    /// A resolver over the given search paths.
    pub fn new(search_paths: Vec<PathBuf>, context: EvaluationContext) -> Self {
        Self {
            search_paths,
            cache_dir: None,
            cache_ttl: Duration::hours(1),
            allow_expired: true,
            context,
        }
    }

    /// Enable the on-disk manifest cache.
    pub fn with_cache(mut self, dir: PathBuf, ttl: Duration, allow_expired: bool) -> Self {
        self.cache_dir = Some(dir);
        self.cache_ttl = ttl;
        self.allow_expired = allow_expired;
        self
    }

    /// Candidate root identifiers in trial order: explicit override, device
    /// serial, then `default`.
    pub fn identifier_chain(overridden: Option<&str>, serial: Option<&str>) -> Vec<String> {
        let mut chain = Vec::new();
        if let Some(id) = overridden {
            if !id.is_empty() {
                chain.push(id.to_string());
            }
        }
        if let Some(serial) = serial {
            if !serial.is_empty() {
                chain.push(serial.to_string());
            }
        }
        chain.push("default".to_string());
        chain
    }

    /// Resolve the first identifier in `candidates` that loads; the usual
    /// call is with [`ManifestResolver::identifier_chain`].
    pub async fn resolve_with_fallback(&self, candidates: &[String]) -> Result<ResolvedManifest> {
        let mut last_err = None;
        for id in candidates {
            match self.resolve(id).await {
                Ok(resolved) => return Ok(resolved),
                Err(ManifestError::NotFound(_)) => {
                    debug!("manifest '{}' not found, trying next candidate", id);
                    last_err = Some(ManifestError::NotFound(id.clone()));
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err.unwrap_or_else(|| ManifestError::NotFound("default".into())))
    }

    /// Resolve `root` and its transitive includes into one flat result.
    pub async fn resolve(&self, root: &str) -> Result<ResolvedManifest> {
        let mut warnings = Vec::new();
        let mut stale = false;

        // Iterative DFS. `Enter` pushes the node onto the path, `Exit` pops
        // it and appends it to the merge order, so includes merge before the
        // manifest that included them.
        enum Frame {
            Enter(String),
            Exit(String),
        }
        let mut stack = vec![Frame::Enter(root.to_string())];
        let mut on_path: HashSet<String> = HashSet::new();
        let mut completed: HashSet<String> = HashSet::new();
        let mut loaded: HashMap<String, Manifest> = HashMap::new();
        let mut order: Vec<String> = Vec::new();

        while let Some(frame) = stack.pop() {
            match frame {
                Frame::Enter(id) => {
                    if on_path.contains(&id) {
                        return Err(ManifestError::CircularDependency(id));
                    }
                    if completed.contains(&id) {
                        continue;
                    }
                    let (manifest, was_stale) = self.load(&id).await?;
                    stale |= was_stale;

                    let mut includes = manifest.included_manifests.clone();
                    for item in &manifest.conditional_items {
                        match predicate::evaluate(&item.condition, &self.context) {
                            Ok(true) => {
                                if let Some(more) = &item.included_manifests {
                                    includes.extend(more.iter().cloned());
                                }
                            }
                            Ok(false) => {}
                            Err(reason) => warnings.push(format!(
                                "manifest '{}': condition '{}' failed to evaluate: {}",
                                id, item.condition, reason
                            )),
                        }
                    }

                    on_path.insert(id.clone());
                    loaded.insert(id.clone(), manifest);
                    stack.push(Frame::Exit(id));
                    // Reversed so the first include is processed (and merged)
                    // first, letting later includes win.
                    for include in includes.into_iter().rev() {
                        stack.push(Frame::Enter(include));
                    }
                }
                Frame::Exit(id) => {
                    on_path.remove(&id);
                    completed.insert(id.clone());
                    order.push(id);
                }
            }
        }

        // Merge in completion order; later manifests override earlier ones.
        let mut sources: Vec<RuleSourceConfig> = Vec::new();
        let mut by_id: HashMap<String, usize> = HashMap::new();
        let mut managed = ManagedRules::default();

        for id in &order {
            let manifest = &loaded[id];
            let mut contributed: Vec<&RuleSourceConfig> = manifest.rule_sources.iter().collect();
            let mut conditional_rules: Vec<&ManagedRules> = Vec::new();
            for item in &manifest.conditional_items {
                if predicate::evaluate(&item.condition, &self.context).unwrap_or(false) {
                    if let Some(s) = &item.rule_sources {
                        contributed.extend(s.iter());
                    }
                    if let Some(r) = &item.managed_rules {
                        conditional_rules.push(r);
                    }
                }
            }

            for source in contributed {
                match by_id.get(source.identifier.as_str()) {
                    Some(&pos) => {
                        let existing = &sources[pos];
                        if existing.url != source.url || existing.path != source.path {
                            warnings.push(format!(
                                "duplicate rule source '{}' with conflicting locations \
                                 ({:?}/{:?} vs {:?}/{:?})",
                                source.identifier,
                                existing.url,
                                existing.path,
                                source.url,
                                source.path
                            ));
                        }
                        // Later include wins unless the earlier one carries a
                        // strictly higher explicit priority.
                        if source.priority >= existing.priority {
                            sources[pos] = source.clone();
                        }
                    }
                    None => {
                        by_id.insert(source.identifier.to_string(), sources.len());
                        sources.push(source.clone());
                    }
                }
            }

            managed.merge_from(&manifest.managed_rules);
            for rules in conditional_rules {
                managed.merge_from(rules);
            }
        }

        info!(
            "resolved manifest '{}': {} manifest(s), {} source(s), {} managed rule(s)",
            root,
            order.len(),
            sources.len(),
            managed.block.len() + managed.allow.len()
        );

        Ok(ResolvedManifest {
            primary: root.to_string(),
            chain: order,
            rule_sources: sources,
            managed_rules: managed,
            resolved_at: Utc::now(),
            warnings,
            stale,
        })
    }

    /// Whether `id` resolves from cache or any search path.
    pub async fn manifest_exists(&self, id: &str) -> bool {
        self.load(id).await.is_ok()
    }

    /// Load one manifest without expanding includes.
    pub async fn manifest(&self, id: &str) -> Result<Manifest> {
        Ok(self.load(id).await?.0)
    }

    // Returns the manifest and whether it came from an expired cache entry.
    async fn load(&self, id: &str) -> Result<(Manifest, bool)> {
        match self.load_from_search_paths(id).await {
            Ok(manifest) => {
                self.cache_store(id, &manifest).await;
                Ok((manifest, false))
            }
            Err(err) => {
                if let Some((manifest, expired)) = self.cache_load(id).await {
                    if !expired {
                        return Ok((manifest, false));
                    }
                    if self.allow_expired {
                        warn!("serving expired cached manifest '{}': {}", id, err);
                        return Ok((manifest, true));
                    }
                }
                Err(err)
            }
        }
    }

    async fn load_from_search_paths(&self, id: &str) -> Result<Manifest> {
        if id.is_empty() || id.contains('/') || id.contains("..") {
            return Err(ManifestError::NotFound(id.to_string()));
        }
        for dir in &self.search_paths {
            for ext in MANIFEST_EXTENSIONS {
                let candidate = if ext.is_empty() {
                    dir.join(id)
                } else {
                    dir.join(format!("{}.{}", id, ext))
                };
                match fs::read(&candidate).await {
                    Ok(data) => {
                        let manifest =
                            Manifest::from_slice(&data, candidate.to_str())?;
                        if manifest.identifier != id {
                            warn!(
                                "manifest file {} declares identifier '{}', expected '{}'",
                                candidate.display(),
                                manifest.identifier,
                                id
                            );
                        }
                        return Ok(manifest);
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                    Err(e) => return Err(e.into()),
                }
            }
        }
        Err(ManifestError::NotFound(id.to_string()))
    }

    fn cache_path(&self, id: &str) -> Option<PathBuf> {
        self.cache_dir.as_ref().map(|d| d.join(format!("{}.json", id)))
    }

    async fn cache_store(&self, id: &str, manifest: &Manifest) {
        let Some(path) = self.cache_path(id) else {
            return;
        };
        if let Some(parent) = path.parent() {
            let _ = fs::create_dir_all(parent).await;
        }
        let envelope = CacheEnvelope {
            cached_at: Utc::now(),
            manifest: manifest.clone(),
        };
        match serde_json::to_vec(&envelope) {
            Ok(data) => {
                if let Err(e) = fs::write(&path, data).await {
                    warn!("failed to cache manifest '{}': {}", id, e);
                }
            }
            Err(e) => warn!("failed to serialize manifest cache entry '{}': {}", id, e),
        }
    }

    async fn cache_load(&self, id: &str) -> Option<(Manifest, bool)> {
        let path = self.cache_path(id)?;
        let data = fs::read(&path).await.ok()?;
        let envelope: CacheEnvelope = serde_json::from_slice(&data).ok()?;
        let expired = Utc::now() - envelope.cached_at > self.cache_ttl;
        Some((envelope.manifest, expired))
    }

    /// Drop the whole disk cache.
    pub async fn clear_cache(&self) -> Result<()> {
        if let Some(dir) = &self.cache_dir {
            if dir.is_dir() {
                let mut entries = fs::read_dir(dir).await?;
                while let Some(entry) = entries.next_entry().await? {
                    let _ = fs::remove_file(entry.path()).await;
                }
            }
        }
        Ok(())
    }

    /// Drop one cached manifest.
    pub async fn clear_cache_for(&self, id: &str) -> Result<()> {
        if let Some(path) = self.cache_path(id) {
            match fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// The search paths, in trial order.
    pub fn search_paths(&self) -> &[PathBuf] {
        &self.search_paths
    }
}
