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
    Ok(plist::from_bytes(data)?)
}

#[cfg(test)]
mod tests {
    use crate::rules::parsers::{parse, ListFormat, ParseOptions};

    #[test]
    fn xml_plist_document() {
        let data = br#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
<plist version="1.0">
<dict>
    <key>name</key>
    <string>Managed List</string>
    <key>blocked</key>
    <array>
        <string>ads.example.com</string>
        <string>*.tracking.com</string>
    </array>
    <key>whitelist</key>
    <array>
        <string>safe.example.com</string>
    </array>
</dict>
</plist>"#;
        let set = parse(data, ListFormat::Plist, ParseOptions::default()).unwrap();
        assert_eq!(set.rules().len(), 3);
        assert_eq!(set.meta().name.as_deref(), Some("Managed List"));
    }
}
