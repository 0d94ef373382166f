// Copyright 2020 LEXUGE
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

//! The zone matcher: a pure, total function from a query name to the zone
//! that should handle it. No I/O, no shared state — every call with the
//! same inputs returns the same zone.

use crate::config::{Zone, ZoneKind};
use crate::pattern::labels_of;

/// Classify `name` against `zones` in order, falling back to `default` if
/// none match. First match wins; an exclusive zone matches anything not
/// caught earlier in the list and not on its own exclude list.
pub fn match_zone<'a>(zones: &'a [Zone], default: &'a Zone, name: &str) -> &'a Zone {
    let labels = labels_of(name);
    for zone in zones {
        match &zone.kind {
            ZoneKind::Inclusive { patterns } => {
                if patterns.iter().any(|p| p.matches(&labels)) {
                    return zone;
                }
            }
            ZoneKind::Exclusive { exclude } => {
                if !exclude.iter().any(|p| p.matches(&labels)) {
                    return zone;
                }
            }
        }
    }
    default
}
