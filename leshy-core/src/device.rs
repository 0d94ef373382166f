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

//! Reads a VPN client's device name out of a file maintained by an external
//! process (e.g. a VPN connect/disconnect hook). Re-read on every call: no
//! inotify watch, no caching, so a route install always sees the freshest
//! value, including "currently disconnected".

use std::path::Path;

/// Read and trim the device name at `path`. Returns `None` if the file is
/// missing or empty, which callers treat as "no device to route through
/// right now".
pub async fn read_device(path: &Path) -> Option<String> {
    let contents = tokio::fs::read_to_string(path).await.ok()?;
    let trimmed = contents.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_path(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("leshy-device-test-{name}"))
    }

    #[tokio::test]
    async fn missing_file_is_none() {
        let path = scratch_path("missing");
        let _ = tokio::fs::remove_file(&path).await;
        assert_eq!(read_device(&path).await, None);
    }

    #[tokio::test]
    async fn empty_file_is_none() {
        let path = scratch_path("empty");
        tokio::fs::write(&path, "  \n").await.unwrap();
        assert_eq!(read_device(&path).await, None);
        let _ = tokio::fs::remove_file(&path).await;
    }

    #[tokio::test]
    async fn trims_surrounding_whitespace() {
        let path = scratch_path("trimmed");
        tokio::fs::write(&path, "tun0\n").await.unwrap();
        assert_eq!(read_device(&path).await, Some("tun0".to_string()));
        let _ = tokio::fs::remove_file(&path).await;
    }
}
