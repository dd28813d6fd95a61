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

#![deny(missing_docs)]
// Documentation
//! A reversed-label domain trie that maps domain suffixes to values.
//!
//! Unlike a plain "is it contained" matcher, every node may carry a value and
//! lookups report *which* stored suffix matched and how many labels it has,
//! which is what suffix-precedence rules need to pick the most specific match.
//!
//! # Getting Started
//!
//! ```
//! use dtrie::DomainTrie;
//! let mut trie = DomainTrie::new();
//! trie.insert("example.com", 1);
//! trie.insert("ads.example.com", 2);
//! assert_eq!(trie.longest_match("x.ads.example.com"), Some((3, &2)));
//! ```

use hashbrown::HashMap;
use std::sync::Arc;

/// Type alias for interned labels. Exposed in case that you need it.
pub type Label = Arc<str>;

#[derive(Debug, PartialEq, Clone)]
struct LevelNode<T> {
    value: Option<T>,
    next_lvs: HashMap<Label, LevelNode<T>>,
}

impl<T> LevelNode<T> {
    fn new() -> Self {
        Self {
            value: None,
            next_lvs: HashMap::new(),
        }
    }
}

/// A trie over reversed domain labels carrying one value per stored name.
#[derive(Debug, Clone)]
pub struct DomainTrie<T> {
    root: LevelNode<T>,
    len: usize,
}

impl<T> Default for DomainTrie<T> {
    fn default() -> Self {
        Self::new()
    }
}

// Yields normalized labels in reverse order, skipping empty labels so that
// both "example.com" and "example.com." walk the same path.
fn rev_labels(domain: &str) -> impl Iterator<Item = String> + '_ {
    domain
        .rsplit('.')
        .filter(|lv| !lv.is_empty())
        .map(|lv| lv.to_ascii_lowercase())
}

impl<T> DomainTrie<T> {
    /// Create an empty trie.
    pub fn new() -> Self {
        Self {
            root: LevelNode::new(),
            len: 0,
        }
    }

    /// Number of names stored.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the trie stores no names.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Remove all names.
    pub fn clear(&mut self) {
        self.root = LevelNode::new();
        self.len = 0;
    }

    /// Insert a name with its value, returning the previous value if the name
    /// was already present.
    pub fn insert(&mut self, domain: &str, value: T) -> Option<T> {
        let mut ptr = &mut self.root;
        for lv in rev_labels(domain) {
            ptr = ptr
                .next_lvs
                .entry(Arc::from(lv.as_str()))
                .or_insert_with(LevelNode::new);
        }
        let old = ptr.value.replace(value);
        if old.is_none() {
            self.len += 1;
        }
        old
    }

    /// Remove a name, returning its value if it was present. Emptied branches
    /// are left in place; call `clear` to reclaim a heavily churned trie.
    pub fn remove(&mut self, domain: &str) -> Option<T> {
        let mut ptr = &mut self.root;
        for lv in rev_labels(domain) {
            ptr = match ptr.next_lvs.get_mut(lv.as_str()) {
                Some(v) => v,
                None => return None,
            };
        }
        let old = ptr.value.take();
        if old.is_some() {
            self.len -= 1;
        }
        old
    }

    /// Look up the value stored for exactly this name.
    pub fn get(&self, domain: &str) -> Option<&T> {
        let mut ptr = &self.root;
        for lv in rev_labels(domain) {
            ptr = match ptr.next_lvs.get(lv.as_str()) {
                Some(v) => v,
                None => return None,
            };
        }
        ptr.value.as_ref()
    }

    /// All stored suffixes of `domain`, shallowest first. Each element is the
    /// label count of the stored suffix and its value; a full-name hit comes
    /// last with the full label count.
    pub fn matching_suffixes(&self, domain: &str) -> Vec<(usize, &T)> {
        let mut out = Vec::new();
        let mut ptr = &self.root;
        let mut depth = 0;
        for lv in rev_labels(domain) {
            ptr = match ptr.next_lvs.get(lv.as_str()) {
                Some(v) => v,
                None => return out,
            };
            depth += 1;
            if let Some(v) = &ptr.value {
                out.push((depth, v));
            }
        }
        out
    }

    /// The deepest stored suffix of `domain`, with its label count.
    pub fn longest_match(&self, domain: &str) -> Option<(usize, &T)> {
        self.matching_suffixes(domain).into_iter().last()
    }

    /// Whether any stored suffix matches `domain`.
    pub fn matches(&self, domain: &str) -> bool {
        self.longest_match(domain).is_some()
    }
}
