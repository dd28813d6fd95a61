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

//! The rule model: single rules, immutable rule sets with their metadata and
//! statistics, and the indexes used to answer "which rules match this name".

pub mod lookup_cache;
pub mod parsers;
pub mod precedence;
pub mod store;

use chrono::{DateTime, Utc};
use dtrie::DomainTrie;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use thiserror::Error;

/// What to do with a matching query.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleAction {
    /// Synthesize a sinkhole answer.
    Block,
    /// Let the query through to the upstream.
    Allow,
    /// Reserved. Behaves like `Block` only when reserved actions are enabled.
    Redirect,
    /// Reserved. Behaves like `Block` only when reserved actions are enabled.
    Monitor,
}

/// How the rule's pattern matches names.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleKind {
    /// One exact label sequence.
    Exact,
    /// `*.suffix`, matching subdomains of the suffix.
    Wildcard,
    /// Stored but never evaluated in the hot path.
    Regex,
}

/// Where a rule came from, ordered by trust for tie-breaking.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provenance {
    /// User-defined override.
    User,
    /// Produced by manifest resolution.
    Manifest,
    /// Fetched from a remote rule source.
    Remote,
    /// Shipped defaults.
    System,
}

impl Provenance {
    /// Tie-break rank. Lower wins: `User > Manifest > Remote > System`.
    pub fn rank(self) -> u8 {
        match self {
            Provenance::User => 0,
            Provenance::Manifest => 1,
            Provenance::Remote => 2,
            Provenance::System => 3,
        }
    }
}

/// Errors building rules from untrusted pattern strings.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RuleError {
    /// The pattern is not a usable domain or wildcard.
    #[error("invalid domain pattern: '{0}'")]
    InvalidDomain(String),
}

fn valid_label_chars(s: &str) -> bool {
    !s.is_empty()
        && s.split('.').all(|lv| {
            !lv.is_empty()
                && lv
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        })
}

/// Normalize a domain pattern: lower-case, strip one trailing dot.
pub fn normalize_domain(raw: &str) -> String {
    let mut s = raw.trim().to_ascii_lowercase();
    if s.ends_with('.') {
        s.pop();
    }
    s
}

/// One filtering rule.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    /// Lower-cased pattern; wildcards stored as `*.suffix`.
    pub domain: String,
    /// Action on match.
    pub action: RuleAction,
    /// Pattern kind.
    pub kind: RuleKind,
    /// Explicit conflict-resolution priority, higher wins within a tier.
    #[serde(default)]
    pub priority: i64,
    /// Originating layer.
    pub provenance: Provenance,
    /// Message shown to the user on block, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_message: Option<String>,
    /// Free-form comment carried from the source list.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    /// Last modification time, used for tie-breaking.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    /// Rules past this instant are logically absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl Rule {
    /// Build a rule from an untrusted pattern, classifying it as exact or
    /// wildcard and validating the labels.
    pub fn new(pattern: &str, action: RuleAction, provenance: Provenance) -> Result<Self, RuleError> {
        let normalized = normalize_domain(pattern);
        let (kind, domain) = if let Some(suffix) = normalized.strip_prefix("*.") {
            if !valid_label_chars(suffix) {
                return Err(RuleError::InvalidDomain(pattern.to_string()));
            }
            (RuleKind::Wildcard, format!("*.{}", suffix))
        } else {
            if !valid_label_chars(&normalized) {
                return Err(RuleError::InvalidDomain(pattern.to_string()));
            }
            (RuleKind::Exact, normalized)
        };
        Ok(Self {
            domain,
            action,
            kind,
            priority: 0,
            provenance,
            custom_message: None,
            comment: None,
            updated_at: None,
            expires_at: None,
        })
    }

    /// Convenience block rule.
    pub fn block(pattern: &str, provenance: Provenance) -> Result<Self, RuleError> {
        Self::new(pattern, RuleAction::Block, provenance)
    }

    /// Convenience allow rule.
    pub fn allow(pattern: &str, provenance: Provenance) -> Result<Self, RuleError> {
        Self::new(pattern, RuleAction::Allow, provenance)
    }

    /// With an explicit priority.
    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    /// With a comment.
    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }

    /// Whether this is a wildcard rule.
    pub fn is_wildcard(&self) -> bool {
        self.kind == RuleKind::Wildcard
    }

    /// The `suffix` of a `*.suffix` rule.
    pub fn wildcard_suffix(&self) -> Option<&str> {
        if self.is_wildcard() {
            self.domain.strip_prefix("*.")
        } else {
            None
        }
    }

    /// Label count of the wildcard suffix; specificity for precedence.
    pub fn suffix_labels(&self) -> usize {
        self.wildcard_suffix()
            .map(|s| s.split('.').count())
            .unwrap_or(0)
    }

    /// Whether the rule is logically absent at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(t) if t <= now)
    }

    /// Whether the rule matches `domain` (already normalized).
    /// `match_root` controls whether `*.S` also matches `S` itself.
    pub fn matches(&self, domain: &str, match_root: bool) -> bool {
        match self.kind {
            RuleKind::Exact => self.domain == domain,
            RuleKind::Wildcard => {
                let suffix = match self.wildcard_suffix() {
                    Some(s) => s,
                    None => return false,
                };
                (match_root && domain == suffix)
                    || (domain.len() > suffix.len() + 1
                        && domain.ends_with(suffix)
                        && domain.as_bytes()[domain.len() - suffix.len() - 1] == b'.')
            }
            RuleKind::Regex => false,
        }
    }
}

/// Descriptive metadata attached to a rule set.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RuleSetMeta {
    /// Name of the list.
    #[serde(default)]
    pub name: Option<String>,
    /// Version string of the list.
    #[serde(default)]
    pub version: Option<String>,
    /// When the list was last updated by its publisher.
    #[serde(default)]
    pub updated: Option<DateTime<Utc>>,
    /// Author or maintainer.
    #[serde(default)]
    pub author: Option<String>,
    /// Where the list came from.
    #[serde(default)]
    pub source_url: Option<String>,
    /// Free-form description.
    #[serde(default)]
    pub description: Option<String>,
    /// License of the list.
    #[serde(default)]
    pub license: Option<String>,
    /// Anything else the list carried.
    #[serde(default)]
    pub custom: serde_json::Map<String, serde_json::Value>,
}

/// Derived statistics over a rule set.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleSetStats {
    /// All rules in the set.
    pub total_rules: usize,
    /// Rules with `Block` action.
    pub block_rules: usize,
    /// Rules with `Allow` action.
    pub allow_rules: usize,
    /// Wildcard rules.
    pub wildcard_rules: usize,
    /// Distinct domain patterns.
    pub unique_domains: usize,
    /// Duplicate `(domain, action)` pairs found on construction.
    pub duplicate_rules: usize,
    /// Entries the parser skipped as invalid.
    pub invalid_rules: usize,
}

/// An immutable, indexed collection of rules. Merges yield new sets.
#[derive(Clone, Debug)]
pub struct RuleSet {
    rules: Vec<Rule>,
    meta: RuleSetMeta,
    stats: RuleSetStats,
    parsed_at: DateTime<Utc>,
    exact: HashMap<String, Vec<usize>>,
    wildcard: DomainTrie<Vec<usize>>,
}

impl RuleSet {
    /// Build a set and its indexes. `invalid_rules` is the count of entries
    /// the producing parser had to skip.
    pub fn new(rules: Vec<Rule>, meta: RuleSetMeta, invalid_rules: usize) -> Self {
        let mut exact: HashMap<String, Vec<usize>> = HashMap::new();
        let mut wildcard: DomainTrie<Vec<usize>> = DomainTrie::new();
        let mut seen: HashSet<(String, RuleAction)> = HashSet::new();
        let mut domains: HashSet<&str> = HashSet::new();
        let mut stats = RuleSetStats {
            total_rules: rules.len(),
            invalid_rules,
            ..Default::default()
        };

        for (i, rule) in rules.iter().enumerate() {
            match rule.action {
                RuleAction::Block => stats.block_rules += 1,
                RuleAction::Allow => stats.allow_rules += 1,
                _ => {}
            }
            domains.insert(rule.domain.as_str());
            if !seen.insert((rule.domain.clone(), rule.action)) {
                stats.duplicate_rules += 1;
            }
            match rule.kind {
                RuleKind::Wildcard => {
                    stats.wildcard_rules += 1;
                    if let Some(suffix) = rule.wildcard_suffix() {
                        if let Some(mut bucket) = wildcard.remove(suffix) {
                            bucket.push(i);
                            wildcard.insert(suffix, bucket);
                        } else {
                            wildcard.insert(suffix, vec![i]);
                        }
                    }
                }
                RuleKind::Exact => exact.entry(rule.domain.clone()).or_default().push(i),
                RuleKind::Regex => {}
            }
        }
        stats.unique_domains = domains.len();

        Self {
            rules,
            meta,
            stats,
            parsed_at: Utc::now(),
            exact,
            wildcard,
        }
    }

    /// An empty set.
    pub fn empty() -> Self {
        Self::new(Vec::new(), RuleSetMeta::default(), 0)
    }

    /// All rules, in source order.
    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    /// The set's metadata.
    pub fn meta(&self) -> &RuleSetMeta {
        &self.meta
    }

    /// Derived statistics.
    pub fn stats(&self) -> &RuleSetStats {
        &self.stats
    }

    /// When this set was constructed.
    pub fn parsed_at(&self) -> DateTime<Utc> {
        self.parsed_at
    }

    /// Every non-expired rule whose pattern can match `domain`, regardless of
    /// wildcard mode. Root-only wildcard matches are included; precedence
    /// filters them by mode.
    pub fn matching_rules(&self, domain: &str, now: DateTime<Utc>) -> Vec<&Rule> {
        let domain = normalize_domain(domain);
        let mut out: Vec<&Rule> = Vec::new();
        if let Some(bucket) = self.exact.get(&domain) {
            out.extend(bucket.iter().map(|&i| &self.rules[i]));
        }
        for (_, bucket) in self.wildcard.matching_suffixes(&domain) {
            out.extend(bucket.iter().map(|&i| &self.rules[i]));
        }
        out.retain(|r| !r.is_expired(now));
        out
    }

    /// The winning rule for `domain` under the given wildcard mode.
    pub fn rule_for_domain(
        &self,
        domain: &str,
        mode: precedence::WildcardMode,
    ) -> Option<&Rule> {
        let domain = normalize_domain(domain);
        let now = Utc::now();
        precedence::resolve(&domain, self.matching_rules(&domain, now), mode)
    }

    /// Quick check whether `domain` resolves to a blocking action.
    pub fn should_block(&self, domain: &str, mode: precedence::WildcardMode) -> bool {
        matches!(
            self.rule_for_domain(domain, mode).map(|r| r.action),
            Some(RuleAction::Block)
        )
    }

    /// Merge with `other`; on identical `(domain, action)` the other set's
    /// rule wins (later layer overrides earlier).
    pub fn merge(&self, other: &RuleSet) -> RuleSet {
        let mut merged: Vec<Rule> = Vec::with_capacity(self.rules.len() + other.rules.len());
        let winners: HashSet<(String, RuleAction)> = other
            .rules
            .iter()
            .map(|r| (r.domain.clone(), r.action))
            .collect();
        merged.extend(
            self.rules
                .iter()
                .filter(|r| !winners.contains(&(r.domain.clone(), r.action)))
                .cloned(),
        );
        merged.extend(other.rules.iter().cloned());

        let meta = RuleSetMeta {
            name: other.meta.name.clone().or_else(|| self.meta.name.clone()),
            ..other.meta.clone()
        };
        let invalid = self.stats.invalid_rules + other.stats.invalid_rules;
        RuleSet::new(merged, meta, invalid)
    }
}
