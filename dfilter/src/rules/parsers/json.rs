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
    Ok(serde_json::from_slice(data)?)
}

#[cfg(test)]
mod tests {
    use crate::rules::parsers::{parse, ListFormat, ParseOptions};
    use crate::rules::RuleAction;

    #[test]
    fn full_document() {
        let data = br#"{
            "version": "1.2",
            "name": "Ad Block List",
            "updated": "2024-05-01T10:00:00Z",
            "author": "someone",
            "source": "https://lists.example.com/ads.json",
            "blocked": [
                "ads.example.com",
                {"domain": "*.tracking.com", "priority": 50, "comment": "trackers"}
            ],
            "whitelist": ["safe.example.com"],
            "metadata": {"category": "ads"}
        }"#;
        let set = parse(data, ListFormat::Json, ParseOptions::default()).unwrap();
        assert_eq!(set.rules().len(), 3);
        assert_eq!(set.meta().name.as_deref(), Some("Ad Block List"));
        assert!(set.meta().updated.is_some());

        let tracker = &set.rules()[1];
        assert_eq!(tracker.domain, "*.tracking.com");
        assert_eq!(tracker.priority, 50);
        assert_eq!(tracker.comment.as_deref(), Some("trackers"));

        let safe = &set.rules()[2];
        assert_eq!(safe.action, RuleAction::Allow);
    }

    #[test]
    fn garbage_is_an_error() {
        assert!(parse(b"{not json", ListFormat::Json, ParseOptions::default()).is_err());
    }
}
