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

//! Hosts-format rule lists.
//!
//! Standard `IP domain [domain...]` lines where a sinkhole IP marks a block
//! entry, plus two directive extensions in comments (`# @whitelist d`,
//! `# @allow d`) and `# Key: value` metadata comments.

use super::{ParseError, ParseOptions, Result};
use crate::rules::{Rule, RuleAction, RuleSet, RuleSetMeta};
use log::warn;

// IPs that count as "block" in hosts lists.
const BLOCK_IPS: [&str; 4] = ["0.0.0.0", "127.0.0.1", "::1", "::"];

pub(super) fn is_blocking_ip(token: &str) -> bool {
    BLOCK_IPS.contains(&token)
}

// Cheap pre-check used by format sniffing: any of the first lines carrying
// a blocking IP in first position makes the payload a hosts file.
pub(crate) fn looks_like_hosts(data: &[u8]) -> bool {
    let text = match std::str::from_utf8(data) {
        Ok(t) => t,
        Err(_) => return false,
    };
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .take(16)
        .any(|l| {
            l.split_whitespace()
                .next()
                .map(is_blocking_ip)
                .unwrap_or(false)
        })
}

fn directive_domain<'a>(comment: &'a str, directive: &str) -> Option<&'a str> {
    let rest = comment.strip_prefix(directive)?;
    // Require a separator so "@allow" does not swallow "@allowlist".
    if !rest.starts_with(char::is_whitespace) {
        return None;
    }
    rest.split_whitespace().next().filter(|d| !d.is_empty())
}

fn push_rule(
    rules: &mut Vec<Rule>,
    invalid: &mut usize,
    options: ParseOptions,
    pattern: &str,
    action: RuleAction,
) -> Result<()> {
    match Rule::new(pattern, action, options.provenance) {
        Ok(rule) => {
            rules.push(rule);
            Ok(())
        }
        Err(e) if options.strict => {
            warn!("rejecting hosts list: {}", e);
            Err(ParseError::InvalidEntry(pattern.to_string()))
        }
        Err(e) => {
            warn!("skipping hosts entry: {}", e);
            *invalid += 1;
            Ok(())
        }
    }
}

pub(super) fn parse(data: &[u8], options: ParseOptions) -> Result<RuleSet> {
    let text = std::str::from_utf8(data).map_err(|_| ParseError::NotText)?;
    let mut rules = Vec::new();
    let mut invalid = 0usize;
    let mut meta = RuleSetMeta::default();

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Some(comment) = line.strip_prefix('#') {
            let comment = comment.trim();
            if let Some(domain) = directive_domain(comment, "@whitelist")
                .or_else(|| directive_domain(comment, "@allow"))
            {
                push_rule(&mut rules, &mut invalid, options, domain, RuleAction::Allow)?;
            } else if let Some((key, value)) = comment.split_once(':') {
                let value = value.trim().to_string();
                if value.is_empty() {
                    continue;
                }
                match key.trim().to_ascii_lowercase().as_str() {
                    "title" | "name" => meta.name = Some(value),
                    "version" => meta.version = Some(value),
                    "author" | "maintainer" => meta.author = Some(value),
                    "description" => meta.description = Some(value),
                    "license" => meta.license = Some(value),
                    "homepage" | "source" => meta.source_url = Some(value),
                    _ => {}
                }
            }
            continue;
        }

        // Data line: strip any inline comment, then `IP domain [domain...]`.
        let data_part = line.split('#').next().unwrap_or("");
        let mut tokens = data_part.split_whitespace();
        let ip = match tokens.next() {
            Some(ip) => ip,
            None => continue,
        };
        if !is_blocking_ip(ip) {
            // Real host mappings are not rules; leave them alone.
            continue;
        }
        let mut seen_domain = false;
        for domain in tokens {
            seen_domain = true;
            if domain.eq_ignore_ascii_case("localhost") {
                continue;
            }
            push_rule(&mut rules, &mut invalid, options, domain, RuleAction::Block)?;
        }
        if !seen_domain {
            invalid += 1;
        }
    }

    Ok(RuleSet::new(rules, meta, invalid))
}
