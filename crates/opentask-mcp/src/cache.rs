//! Tools-cache file.
//!
//! Listing tools means launching every server in the catalog, so results are
//! persisted to a sibling file next to the catalog, tagged with the catalog
//! file's modification time.  The cache is stale when either signal fires:
//! the stored mtime no longer matches the catalog's current mtime, or the
//! cache file itself is older than 48 hours.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::dispatcher::ToolDescriptor;
use crate::error::Result;

/// Caches older than this are refreshed regardless of mtime agreement.
pub const MAX_CACHE_AGE: Duration = Duration::from_secs(48 * 60 * 60);

#[derive(Debug, Serialize, Deserialize)]
struct CacheFile {
    config_mtime: u64,
    tools_cache: BTreeMap<String, Vec<ToolDescriptor>>,
}

/// A file's mtime in whole seconds since the epoch; 0 when unavailable.
pub fn file_mtime(path: &Path) -> u64 {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map_or(0, |d| d.as_secs())
}

/// Load the cache if it is still fresh for the given catalog mtime.
pub fn load_cache(
    cache_path: &Path,
    catalog_mtime: u64,
) -> Option<BTreeMap<String, Vec<ToolDescriptor>>> {
    let modified = std::fs::metadata(cache_path).and_then(|m| m.modified()).ok()?;
    let age = SystemTime::now().duration_since(modified).unwrap_or_default();
    if age > MAX_CACHE_AGE {
        tracing::debug!(path = %cache_path.display(), "tools cache older than 48h, refreshing");
        return None;
    }

    let content = std::fs::read_to_string(cache_path).ok()?;
    let cache: CacheFile = serde_json::from_str(&content).ok()?;

    if cache.config_mtime != catalog_mtime {
        tracing::debug!(
            stored = cache.config_mtime,
            current = catalog_mtime,
            "catalog mtime drifted, refreshing tools cache"
        );
        return None;
    }

    tracing::debug!(path = %cache_path.display(), servers = cache.tools_cache.len(), "tools cache loaded");
    Some(cache.tools_cache)
}

/// Persist the cache next to the catalog.
pub fn save_cache(
    cache_path: &Path,
    catalog_mtime: u64,
    tools: &BTreeMap<String, Vec<ToolDescriptor>>,
) -> Result<()> {
    let cache = CacheFile {
        config_mtime: catalog_mtime,
        tools_cache: tools.clone(),
    };
    std::fs::write(cache_path, serde_json::to_string_pretty(&cache)?)?;
    tracing::debug!(path = %cache_path.display(), "tools cache saved");
    Ok(())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn sample_tools() -> BTreeMap<String, Vec<ToolDescriptor>> {
        let mut tools = BTreeMap::new();
        tools.insert(
            "weather".to_owned(),
            vec![ToolDescriptor {
                name: "get_alerts".into(),
                description: Some("Get weather alerts".into()),
                input_schema: json!({"properties": {"state": {"type": "string"}}, "required": ["state"]}),
                server: "weather".into(),
            }],
        );
        tools
    }

    #[test]
    fn round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tools_cache.json");

        save_cache(&path, 1234, &sample_tools()).unwrap();
        let loaded = load_cache(&path, 1234).unwrap();
        assert_eq!(loaded["weather"][0].name, "get_alerts");
        assert_eq!(loaded["weather"][0].server, "weather");
    }

    #[test]
    fn mtime_drift_invalidates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tools_cache.json");

        save_cache(&path, 1234, &sample_tools()).unwrap();
        assert!(load_cache(&path, 9999).is_none());
    }

    #[test]
    fn missing_or_garbled_cache_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("absent.json");
        assert!(load_cache(&missing, 0).is_none());

        let garbled = dir.path().join("bad.json");
        std::fs::write(&garbled, "not json").unwrap();
        assert!(load_cache(&garbled, 0).is_none());
    }

    #[test]
    fn file_mtime_of_missing_file_is_zero() {
        assert_eq!(file_mtime(Path::new("/definitely/not/here.json")), 0);
    }
}
