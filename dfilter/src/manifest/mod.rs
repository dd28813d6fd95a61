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

//! Manifest-based layered configuration.
//!
//! A manifest names rule sources, carries inline managed rules, includes
//! other manifests, and guards any of those behind predicates. Resolution
//! flattens a manifest hierarchy into one effective source list and rule
//! set.

pub mod predicate;
pub mod resolver;

pub use predicate::EvaluationContext;
pub use resolver::{ManifestResolver, ResolvedManifest};

use crate::{fetch::AuthScheme, rules::parsers::ListFormat, Label};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, path::PathBuf};
use thiserror::Error;

/// A shorthand for returning manifest errors.
pub type Result<T> = std::result::Result<T, ManifestError>;

/// All possible errors that may incur while loading or resolving manifests.
#[derive(Debug, Error)]
pub enum ManifestError {
    /// No search path or cache produced the manifest.
    #[error("manifest '{0}' not found in any search path")]
    NotFound(String),

    /// The include graph loops back onto the current resolution path.
    #[error("circular manifest dependency via '{0}'")]
    CircularDependency(String),

    /// The file did not deserialize as a manifest.
    #[error("invalid manifest format: {0}")]
    InvalidFormat(String),

    /// A required field is empty or missing.
    #[error("manifest is missing required field '{0}'")]
    MissingRequired(&'static str),

    /// A conditional item's predicate does not parse.
    #[error("invalid condition '{condition}': {reason}")]
    InvalidCondition {
        /// The offending predicate text.
        condition: String,
        /// Why it was rejected.
        reason: String,
    },

    /// A rule source descriptor is unusable.
    #[error("invalid rule source '{identifier}': {reason}")]
    InvalidSource {
        /// The source identifier.
        identifier: String,
        /// Why it was rejected.
        reason: String,
    },

    /// Error forwarded from `std::io::Error`.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Transport for a rule source.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// Fetched over HTTPS.
    Https,
    /// Read from a local path.
    File,
}

fn default_update_interval() -> u64 {
    3600
}

fn default_enabled() -> bool {
    true
}

fn default_max_redirects() -> u32 {
    5
}

/// A named external provider of rules with its format and update policy.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RuleSourceConfig {
    /// Unique identifier within a configuration.
    pub identifier: Label,
    /// Human-readable name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Transport kind.
    #[serde(rename = "type")]
    pub kind: SourceKind,
    /// Declared payload format; sniffed when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<ListFormat>,
    /// Endpoint for `Https` sources.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Path for `File` sources.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    /// Refresh period in seconds.
    #[serde(default = "default_update_interval")]
    pub update_interval: u64,
    /// Merge priority; higher wins on identifier conflicts.
    #[serde(default)]
    pub priority: i64,
    /// Disabled sources are kept but never scheduled.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Authentication for `Https` sources; credentials stay opaque handles.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<AuthScheme>,
    /// Extra request headers for `Https` sources.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    /// SHA-256 certificate pins (hex) for `Https` sources.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pinned_cert_hashes: Vec<String>,
    /// Accepted HTTP statuses; 200 when empty.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub accepted_statuses: Vec<u16>,
    /// Redirect-follow bound.
    #[serde(default = "default_max_redirects")]
    pub max_redirects: u32,
    /// Permit `http://` URLs. Off by default.
    #[serde(default)]
    pub allow_insecure_http: bool,
    /// Watch `File` sources for modification.
    #[serde(default)]
    pub watch: bool,
}

impl RuleSourceConfig {
    /// Validate the descriptor; `Https` needs an https URL (unless insecure
    /// is explicitly allowed), `File` needs a path.
    pub fn validate(&self) -> Result<()> {
        if self.identifier.is_empty() {
            return Err(ManifestError::MissingRequired("identifier"));
        }
        match self.kind {
            SourceKind::Https => {
                let url = self.url.as_deref().ok_or(ManifestError::InvalidSource {
                    identifier: self.identifier.to_string(),
                    reason: "https source without url".into(),
                })?;
                if !url.starts_with("https://") && !(self.allow_insecure_http && url.starts_with("http://")) {
                    return Err(ManifestError::InvalidSource {
                        identifier: self.identifier.to_string(),
                        reason: format!("url '{}' must use the https scheme", url),
                    });
                }
            }
            SourceKind::File => {
                if self.path.is_none() {
                    return Err(ManifestError::InvalidSource {
                        identifier: self.identifier.to_string(),
                        reason: "file source without path".into(),
                    });
                }
            }
        }
        Ok(())
    }
}

/// Inline rules carried directly in a manifest.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ManagedRules {
    /// Domains to block.
    #[serde(default)]
    pub block: Vec<String>,
    /// Domains to allow.
    #[serde(default)]
    pub allow: Vec<String>,
}

impl ManagedRules {
    /// Whether both lists are empty.
    pub fn is_empty(&self) -> bool {
        self.block.is_empty() && self.allow.is_empty()
    }

    /// Union `other` into `self`; duplicates collapse, the later layer's
    /// entry stands for identical `(domain, action)` keys.
    pub fn merge_from(&mut self, other: &ManagedRules) {
        for d in &other.block {
            if !self.block.contains(d) {
                self.block.push(d.clone());
            }
        }
        for d in &other.allow {
            if !self.allow.contains(d) {
                self.allow.push(d.clone());
            }
        }
    }
}

/// A predicate-guarded contribution.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConditionalItem {
    /// Predicate evaluated against the current context.
    pub condition: String,
    /// Rules applied when the predicate holds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub managed_rules: Option<ManagedRules>,
    /// Sources applied when the predicate holds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule_sources: Option<Vec<RuleSourceConfig>>,
    /// Includes applied when the predicate holds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub included_manifests: Option<Vec<String>>,
}

/// Descriptive manifest metadata.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ManifestMetadata {
    /// Author or owner.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    /// Free-form description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Last modification time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<DateTime<Utc>>,
    /// Version string.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Anything else the manifest carried.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub custom: BTreeMap<String, serde_json::Value>,
}

/// One manifest document.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    /// Non-empty identifier.
    pub identifier: String,
    /// Human-readable name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    /// Other manifests merged into this one.
    #[serde(default)]
    pub included_manifests: Vec<String>,
    /// Rule sources this manifest contributes.
    #[serde(default)]
    pub rule_sources: Vec<RuleSourceConfig>,
    /// Inline rules this manifest contributes.
    #[serde(default)]
    pub managed_rules: ManagedRules,
    /// Predicate-guarded contributions.
    #[serde(default)]
    pub conditional_items: Vec<ConditionalItem>,
    /// Descriptive metadata.
    #[serde(default)]
    pub metadata: ManifestMetadata,
    /// Schema version of the manifest itself.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manifest_version: Option<String>,
}

impl Manifest {
    /// Deserialize from JSON, YAML, or plist bytes. Formats are told apart
    /// by extension hint first, then by the first non-whitespace byte.
    pub fn from_slice(data: &[u8], path_hint: Option<&str>) -> Result<Self> {
        let manifest: Manifest = match sniff(path_hint, data) {
            ManifestFormat::Json => serde_json::from_slice(data)
                .map_err(|e| ManifestError::InvalidFormat(e.to_string()))?,
            ManifestFormat::Plist => {
                plist::from_bytes(data).map_err(|e| ManifestError::InvalidFormat(e.to_string()))?
            }
            ManifestFormat::Yaml => serde_yaml::from_slice(data)
                .map_err(|e| ManifestError::InvalidFormat(e.to_string()))?,
        };
        manifest.validate()?;
        Ok(manifest)
    }

    /// Check structural invariants.
    pub fn validate(&self) -> Result<()> {
        if self.identifier.is_empty() {
            return Err(ManifestError::MissingRequired("identifier"));
        }
        for source in &self.rule_sources {
            source.validate()?;
        }
        for item in &self.conditional_items {
            predicate::validate(&item.condition).map_err(|reason| {
                ManifestError::InvalidCondition {
                    condition: item.condition.clone(),
                    reason,
                }
            })?;
            if let Some(sources) = &item.rule_sources {
                for source in sources {
                    source.validate()?;
                }
            }
        }
        Ok(())
    }
}

enum ManifestFormat {
    Json,
    Yaml,
    Plist,
}

fn sniff(path_hint: Option<&str>, data: &[u8]) -> ManifestFormat {
    if let Some(ext) = path_hint.and_then(|p| p.rsplit('.').next()) {
        match ext.to_ascii_lowercase().as_str() {
            "json" => return ManifestFormat::Json,
            "yaml" | "yml" => return ManifestFormat::Yaml,
            "plist" => return ManifestFormat::Plist,
            _ => {}
        }
    }
    match data.iter().find(|b| !b.is_ascii_whitespace()) {
        Some(b'{') | Some(b'[') => ManifestFormat::Json,
        Some(b'<') => ManifestFormat::Plist,
        _ => ManifestFormat::Yaml,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_manifest_roundtrip() {
        let data = br#"{
            "identifier": "corp",
            "display_name": "Corporate",
            "included_manifests": ["base"],
            "rule_sources": [{
                "identifier": "ads",
                "type": "https",
                "format": "hosts",
                "url": "https://lists.example.com/ads.hosts",
                "update_interval": 1800,
                "priority": 10
            }],
            "managed_rules": {"block": ["bad.example.com"], "allow": ["good.example.com"]},
            "conditional_items": [
                {"condition": "vpnConnected == true", "managed_rules": {"block": ["vpn-bad.example.com"]}}
            ],
            "metadata": {"author": "it", "version": "2"},
            "manifest_version": "1.0"
        }"#;
        let m = Manifest::from_slice(data, None).unwrap();
        assert_eq!(m.identifier, "corp");
        assert_eq!(m.included_manifests, vec!["base"]);
        assert_eq!(m.rule_sources[0].kind, SourceKind::Https);
        assert_eq!(m.rule_sources[0].update_interval, 1800);
        assert_eq!(m.conditional_items.len(), 1);
    }

    #[test]
    fn yaml_manifest_by_sniff() {
        let data = b"identifier: base\nmanaged_rules:\n  block:\n    - ads.example.com\n";
        let m = Manifest::from_slice(data, None).unwrap();
        assert_eq!(m.identifier, "base");
        assert_eq!(m.managed_rules.block, vec!["ads.example.com"]);
    }

    #[test]
    fn empty_identifier_rejected() {
        let data = br#"{"identifier": ""}"#;
        assert!(matches!(
            Manifest::from_slice(data, None),
            Err(ManifestError::MissingRequired("identifier"))
        ));
    }

    #[test]
    fn https_scheme_enforced() {
        let source = RuleSourceConfig {
            identifier: "s".into(),
            name: None,
            kind: SourceKind::Https,
            format: None,
            url: Some("http://insecure.example.com/list".into()),
            path: None,
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
        assert!(source.validate().is_err());
        let mut relaxed = source;
        relaxed.allow_insecure_http = true;
        assert!(relaxed.validate().is_ok());
    }

    #[test]
    fn bad_condition_rejected_at_load() {
        let data = br#"{"identifier": "x", "conditional_items": [{"condition": "((("}]}"#;
        assert!(matches!(
            Manifest::from_slice(data, None),
            Err(ManifestError::InvalidCondition { .. })
        ));
    }

    #[test]
    fn managed_rules_merge_dedups() {
        let mut a = ManagedRules {
            block: vec!["x.com".into()],
            allow: vec![],
        };
        let b = ManagedRules {
            block: vec!["x.com".into(), "y.com".into()],
            allow: vec!["ok.com".into()],
        };
        a.merge_from(&b);
        assert_eq!(a.block, vec!["x.com", "y.com"]);
        assert_eq!(a.allow, vec!["ok.com"]);
    }
}
