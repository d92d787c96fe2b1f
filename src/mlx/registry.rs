//! Model Registry (spec §4.2): a JSON file listing `{id, downloaded_at}`
//! pairs, written atomically via a temporary file and rename.
//!
//! Grounded on the teacher's `web/config.rs::load_config`/
//! `add_to_model_history` load-mutate-save pattern, hardened from
//! "truncate and overwrite" to temp-file+rename since spec.md §5 requires
//! atomic registry writes.

use std::path::{Path, PathBuf};

use crate::mlx::cache_resolver::CacheResolver;
use crate::types::CachedModelEntry;

pub struct ModelRegistry {
    path: PathBuf,
}

impl ModelRegistry {
    pub fn new(path: PathBuf) -> Self {
        ModelRegistry { path }
    }

    /// `~/.afm/mlx-model-registry.json` (spec §6 persisted state).
    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".afm")
            .join("mlx-model-registry.json")
    }

    pub fn from_default_path() -> Self {
        ModelRegistry::new(Self::default_path())
    }

    fn load(&self) -> Vec<CachedModelEntry> {
        let Ok(content) = std::fs::read_to_string(&self.path) else {
            return Vec::new();
        };
        serde_json::from_str(&content).unwrap_or_default()
    }

    /// Write the sorted-by-id union of all known local models, atomically.
    fn save(&self, mut entries: Vec<CachedModelEntry>) -> std::io::Result<()> {
        entries.sort();
        entries.dedup_by(|a, b| a.id == b.id);
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(&entries)?;
        let tmp_path = tmp_path_for(&self.path);
        std::fs::write(&tmp_path, json)?;
        std::fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }

    /// No-op if `id` is already present.
    pub fn register(&self, id: &str, downloaded_at: i64) -> std::io::Result<()> {
        let mut entries = self.load();
        if entries.iter().any(|e| e.id == id) {
            return Ok(());
        }
        entries.push(CachedModelEntry {
            id: id.to_string(),
            downloaded_at,
        });
        self.save(entries)
    }

    /// Prune entries whose directories vanished, persist, return the
    /// surviving id list.
    pub fn revalidate(&self, resolver: &CacheResolver) -> std::io::Result<Vec<String>> {
        let entries = self.load();
        let surviving: Vec<CachedModelEntry> = entries
            .into_iter()
            .filter(|e| resolver.resolve(&e.id).is_some())
            .collect();
        let ids = surviving.iter().map(|e| e.id.clone()).collect();
        self.save(surviving)?;
        Ok(ids)
    }
}

fn tmp_path_for(path: &Path) -> PathBuf {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(format!(".tmp-{}", std::process::id()));
    PathBuf::from(tmp)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_registry() -> ModelRegistry {
        let path = std::env::temp_dir().join(format!("afm-registry-{}.json", uuid::Uuid::new_v4()));
        ModelRegistry::new(path)
    }

    #[test]
    fn register_is_idempotent() {
        let registry = temp_registry();
        registry.register("mlx-community/foo", 100).unwrap();
        registry.register("mlx-community/foo", 200).unwrap();
        let entries = registry.load();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].downloaded_at, 100);
        std::fs::remove_file(&registry.path).ok();
    }

    #[test]
    fn save_is_sorted_and_deduped() {
        let registry = temp_registry();
        registry.register("zeta", 1).unwrap();
        registry.register("alpha", 2).unwrap();
        let entries = registry.load();
        assert_eq!(entries[0].id, "alpha");
        assert_eq!(entries[1].id, "zeta");
        std::fs::remove_file(&registry.path).ok();
    }

    #[test]
    fn revalidate_prunes_missing_directories() {
        let registry = temp_registry();
        registry.register("ghost-model", 1).unwrap();
        let root = std::env::temp_dir().join(format!("afm-resolver-{}", uuid::Uuid::new_v4()));
        let resolver = CacheResolver::new(root);
        let surviving = registry.revalidate(&resolver).unwrap();
        assert!(surviving.is_empty());
        std::fs::remove_file(&registry.path).ok();
    }
}
