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

use super::{ListDocument, Result};

pub(super) fn parse(data: &[u8]) -> Result<ListDocument> {
    Ok(serde_yaml::from_slice(data)?)
}

#[cfg(test)]
mod tests {
    use crate::rules::parsers::{parse, ListFormat, ParseOptions};

    #[test]
    fn yaml_document() {
        let data = br#"
name: Trackers
blocked:
  - ads.example.com
  - domain: "*.metrics.example.com"
    priority: 10
whitelist:
  - cdn.example.com
"#;
        let set = parse(data, ListFormat::Yaml, ParseOptions::default()).unwrap();
        assert_eq!(set.rules().len(), 3);
        assert_eq!(set.stats().block_rules, 2);
        assert_eq!(set.stats().allow_rules, 1);
        assert_eq!(set.stats().wildcard_rules, 1);
    }
}
