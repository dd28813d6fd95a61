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

//! Pure conflict resolution over the rules matching one name.
//!
//! Precedence order (highest to lowest):
//! 1. Exact allow rules
//! 2. Exact block rules
//! 3. Wildcard allow rules (more specific first)
//! 4. Wildcard block rules (more specific first)

use super::{Rule, RuleAction, RuleKind};
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;

/// Whether `*.example.com` also covers `example.com` itself.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WildcardMode {
    /// A wildcard only matches proper subdomains.
    #[default]
    SubdomainsOnly,
    /// A wildcard also matches the root domain.
    IncludeRoot,
    /// Like `IncludeRoot`, unless an explicit allow for the root exists.
    Smart,
}

impl WildcardMode {
    fn match_root(self, domain: &str, candidates: &[&Rule]) -> bool {
        match self {
            WildcardMode::SubdomainsOnly => false,
            WildcardMode::IncludeRoot => true,
            WildcardMode::Smart => !candidates.iter().any(|r| {
                r.kind == RuleKind::Exact && r.action == RuleAction::Allow && r.domain == domain
            }),
        }
    }
}

// Precedence tier; lower wins. Reserved actions sit with Block so an
// explicit allow always overrides them.
fn tier(rule: &Rule) -> u8 {
    match (rule.kind, rule.action) {
        (RuleKind::Exact, RuleAction::Allow) => 0,
        (RuleKind::Exact, _) => 1,
        (RuleKind::Wildcard, RuleAction::Allow) => 2,
        (RuleKind::Wildcard, _) => 3,
        (RuleKind::Regex, _) => u8::MAX,
    }
}

/// Resolve the winning rule for `domain` among `candidates`.
///
/// Callers pass every candidate whose pattern can match the name (root-only
/// wildcard matches included); this function applies the wildcard mode,
/// the tier order, and the in-tier tie-breaks. Expired rules must already be
/// filtered out.
pub fn resolve<'a, I>(domain: &str, candidates: I, mode: WildcardMode) -> Option<&'a Rule>
where
    I: IntoIterator<Item = &'a Rule>,
{
    let candidates: Vec<&Rule> = candidates.into_iter().collect();
    let match_root = mode.match_root(domain, &candidates);

    candidates
        .into_iter()
        .filter(|r| r.kind != RuleKind::Regex && r.matches(domain, match_root))
        .min_by_key(|r| {
            (
                tier(r),
                // Longest suffix (most labels) first within wildcard tiers.
                Reverse(r.suffix_labels()),
                // Higher explicit priority first.
                Reverse(r.priority),
                // Most recently updated first; undated rules lose.
                Reverse(r.updated_at.map(|t| t.timestamp_millis()).unwrap_or(i64::MIN)),
                r.provenance.rank(),
            )
        })
}

/// The resolved action for `domain`, if any rule matches.
pub fn resolve_action<'a, I>(domain: &str, candidates: I, mode: WildcardMode) -> Option<RuleAction>
where
    I: IntoIterator<Item = &'a Rule>,
{
    resolve(domain, candidates, mode).map(|r| r.action)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::Provenance;
    use chrono::{TimeZone, Utc};

    fn block(pattern: &str) -> Rule {
        Rule::block(pattern, Provenance::Remote).unwrap()
    }

    fn allow(pattern: &str) -> Rule {
        Rule::allow(pattern, Provenance::Remote).unwrap()
    }

    #[test]
    fn exact_allow_overrides_everything() {
        let rules = vec![
            block("safe.example.com"),
            block("*.example.com"),
            block("*.safe.example.com"),
            allow("safe.example.com"),
        ];
        assert_eq!(
            resolve_action("safe.example.com", &rules, WildcardMode::SubdomainsOnly),
            Some(RuleAction::Allow)
        );
    }

    #[test]
    fn adding_rules_only_moves_toward_higher_tiers() {
        let mut rules = vec![block("*.example.com")];
        assert_eq!(
            resolve_action("d.example.com", &rules, WildcardMode::SubdomainsOnly),
            Some(RuleAction::Block)
        );
        rules.push(allow("*.example.com"));
        assert_eq!(
            resolve_action("d.example.com", &rules, WildcardMode::SubdomainsOnly),
            Some(RuleAction::Allow)
        );
        rules.push(block("d.example.com"));
        assert_eq!(
            resolve_action("d.example.com", &rules, WildcardMode::SubdomainsOnly),
            Some(RuleAction::Block)
        );
        rules.push(allow("d.example.com"));
        assert_eq!(
            resolve_action("d.example.com", &rules, WildcardMode::SubdomainsOnly),
            Some(RuleAction::Allow)
        );
    }

    #[test]
    fn longest_wildcard_suffix_wins() {
        let rules = vec![allow("*.ads.example.com"), block("*.example.com")];
        assert_eq!(
            resolve_action("x.ads.example.com", &rules, WildcardMode::SubdomainsOnly),
            Some(RuleAction::Allow)
        );
        // Same-tier contest: deeper suffix wins regardless of list order.
        let rules = vec![block("*.example.com"), block("*.ads.example.com")];
        let winner = resolve("x.ads.example.com", &rules, WildcardMode::SubdomainsOnly).unwrap();
        assert_eq!(winner.domain, "*.ads.example.com");
    }

    #[test]
    fn wildcard_root_modes() {
        let rules = vec![block("*.example.com")];
        assert_eq!(
            resolve_action("example.com", &rules, WildcardMode::SubdomainsOnly),
            None
        );
        assert_eq!(
            resolve_action("example.com", &rules, WildcardMode::IncludeRoot),
            Some(RuleAction::Block)
        );
        assert_eq!(
            resolve_action("a.example.com", &rules, WildcardMode::SubdomainsOnly),
            Some(RuleAction::Block)
        );

        // Smart: root is covered until an explicit allow for it appears.
        assert_eq!(
            resolve_action(
                "example.com",
                &rules,
                WildcardMode::Smart
            ),
            Some(RuleAction::Block)
        );
        let with_allow = vec![block("*.example.com"), allow("example.com")];
        assert_eq!(
            resolve_action(
                "example.com",
                &with_allow,
                WildcardMode::Smart
            ),
            Some(RuleAction::Allow)
        );
    }

    #[test]
    fn tie_breaks_within_tier() {
        // Higher explicit priority wins.
        let rules = vec![
            block("ads.example.com").with_priority(10),
            allow("other.example.com"),
            {
                let mut r = block("ads.example.com").with_priority(999);
                r.custom_message = Some("winner".into());
                r
            },
        ];
        let winner = resolve("ads.example.com", &rules, WildcardMode::SubdomainsOnly).unwrap();
        assert_eq!(winner.custom_message.as_deref(), Some("winner"));

        // Equal priority: newer updated_at wins.
        let mut older = block("x.com");
        older.updated_at = Some(Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap());
        let mut newer = block("x.com");
        newer.updated_at = Some(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        newer.comment = Some("newer".into());
        let rules = vec![older, newer];
        let winner = resolve("x.com", &rules, WildcardMode::SubdomainsOnly).unwrap();
        assert_eq!(winner.comment.as_deref(), Some("newer"));

        // Equal everything else: user beats remote.
        let user = Rule::block("y.com", Provenance::User).unwrap();
        let remote = Rule::block("y.com", Provenance::Remote).unwrap();
        let rules = vec![remote, user];
        let winner = resolve("y.com", &rules, WildcardMode::SubdomainsOnly).unwrap();
        assert_eq!(winner.provenance, Provenance::User);
    }

    #[test]
    fn regex_rules_never_win() {
        let mut regex = Rule::block("ads.example.com", Provenance::Remote).unwrap();
        regex.kind = RuleKind::Regex;
        let rules = vec![regex];
        assert_eq!(
            resolve_action("ads.example.com", &rules, WildcardMode::SubdomainsOnly),
            None
        );
    }
}
