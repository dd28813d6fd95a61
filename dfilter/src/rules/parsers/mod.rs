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

//! Rule list parsers.
//!
//! JSON, YAML, and plist lists share one dictionary shape; the hosts format
//! is line-oriented. Format selection: declared format, then file extension,
//! then content sniffing.

mod hosts;
mod json;
mod plist_fmt;
mod yaml;

use super::{Provenance, Rule, RuleAction, RuleSet, RuleSetMeta};
use chrono::{DateTime, Utc};
use log::warn;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A shorthand for returning parse errors.
pub type Result<T> = std::result::Result<T, ParseError>;

/// All possible errors raised while parsing rule lists.
#[derive(Debug, Error)]
pub enum ParseError {
    /// The payload matched no known format.
    #[error("unsupported or undetectable rule list format")]
    UnknownFormat,

    /// The payload is not text where text was required.
    #[error("rule list is not valid UTF-8")]
    NotText,

    /// JSON deserialization failed.
    #[error("invalid JSON rule list: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML deserialization failed.
    #[error("invalid YAML rule list: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Plist deserialization failed.
    #[error("invalid plist rule list: {0}")]
    Plist(#[from] ::plist::Error),

    /// An entry failed validation under strict parsing.
    #[error("invalid rule entry '{0}'")]
    InvalidEntry(String),
}

/// Wire formats a rule source may declare.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListFormat {
    /// The shared dictionary shape as JSON.
    Json,
    /// The shared dictionary shape as YAML.
    Yaml,
    /// Standard hosts file with directive extensions.
    Hosts,
    /// The shared dictionary shape as a property list.
    Plist,
}

/// Knobs controlling how lists convert into rule sets.
#[derive(Clone, Copy, Debug)]
pub struct ParseOptions {
    /// Fail the whole payload on any invalid entry instead of skipping it.
    pub strict: bool,
    /// Provenance stamped on produced rules.
    pub provenance: Provenance,
}

impl Default for ParseOptions {
    fn default() -> Self {
        Self {
            strict: false,
            provenance: Provenance::Remote,
        }
    }
}

// The dictionary shape shared by JSON/YAML/plist lists.
#[derive(Debug, Default, Deserialize)]
pub(crate) struct ListDocument {
    #[serde(default)]
    version: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    updated: Option<String>,
    #[serde(default)]
    author: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    source: Option<String>,
    #[serde(default)]
    license: Option<String>,
    #[serde(default)]
    blocked: Vec<ListEntry>,
    #[serde(default, alias = "allowed", alias = "allow")]
    whitelist: Vec<ListEntry>,
    #[serde(default)]
    metadata: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub(crate) enum ListEntry {
    Plain(String),
    Detailed {
        domain: String,
        #[serde(default)]
        priority: Option<i64>,
        #[serde(default)]
        comment: Option<String>,
    },
}

/// Pick the format: declared wins, then the path extension, then a content
/// sniff (`{`/`[` means JSON, `<` means plist, block-IP lines mean hosts,
/// anything else is tried as YAML).
pub fn detect_format(
    declared: Option<ListFormat>,
    path_hint: Option<&str>,
    data: &[u8],
) -> ListFormat {
    if let Some(f) = declared {
        return f;
    }
    if let Some(ext) = path_hint.and_then(|p| p.rsplit('.').next()) {
        match ext.to_ascii_lowercase().as_str() {
            "json" => return ListFormat::Json,
            "yaml" | "yml" => return ListFormat::Yaml,
            "plist" => return ListFormat::Plist,
            "hosts" | "txt" => return ListFormat::Hosts,
            _ => {}
        }
    }
    match data.iter().find(|b| !b.is_ascii_whitespace()) {
        Some(b'{') | Some(b'[') => ListFormat::Json,
        Some(b'<') => ListFormat::Plist,
        _ => {
            if hosts::looks_like_hosts(data) {
                ListFormat::Hosts
            } else {
                ListFormat::Yaml
            }
        }
    }
}

/// Parse a payload in the given format into a rule set.
pub fn parse(data: &[u8], format: ListFormat, options: ParseOptions) -> Result<RuleSet> {
    match format {
        ListFormat::Json => document_to_set(json::parse(data)?, options),
        ListFormat::Yaml => document_to_set(yaml::parse(data)?, options),
        ListFormat::Plist => document_to_set(plist_fmt::parse(data)?, options),
        ListFormat::Hosts => hosts::parse(data, options),
    }
}

fn parse_updated(raw: Option<&str>) -> Option<DateTime<Utc>> {
    let raw = raw?;
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .ok()
        .or_else(|| {
            chrono::NaiveDate::parse_from_str(raw, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
                .map(|t| t.and_utc())
        })
}

fn document_to_set(doc: ListDocument, options: ParseOptions) -> Result<RuleSet> {
    let mut rules = Vec::with_capacity(doc.blocked.len() + doc.whitelist.len());
    let mut invalid = 0usize;

    let mut push = |entry: &ListEntry, action: RuleAction| -> Result<()> {
        let (pattern, priority, comment) = match entry {
            ListEntry::Plain(d) => (d.as_str(), None, None),
            ListEntry::Detailed {
                domain,
                priority,
                comment,
            } => (domain.as_str(), *priority, comment.clone()),
        };
        match Rule::new(pattern, action, options.provenance) {
            Ok(mut rule) => {
                rule.priority = priority.unwrap_or(0);
                rule.comment = comment;
                rules.push(rule);
                Ok(())
            }
            Err(e) if options.strict => {
                warn!("rejecting rule list: {}", e);
                Err(ParseError::InvalidEntry(pattern.to_string()))
            }
            Err(e) => {
                warn!("skipping rule entry: {}", e);
                invalid += 1;
                Ok(())
            }
        }
    };

    for entry in &doc.blocked {
        push(entry, RuleAction::Block)?;
    }
    for entry in &doc.whitelist {
        push(entry, RuleAction::Allow)?;
    }
    drop(push);

    let meta = RuleSetMeta {
        name: doc.name,
        version: doc.version,
        updated: parse_updated(doc.updated.as_deref()),
        author: doc.author,
        source_url: doc.source,
        description: doc.description,
        license: doc.license,
        custom: doc.metadata,
    };
    Ok(RuleSet::new(rules, meta, invalid))
}
