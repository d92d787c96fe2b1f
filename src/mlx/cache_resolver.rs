//! Cache Resolver (spec §4.1): translates a raw model identifier into an
//! absolute weight directory.
//!
//! Grounded on the teacher's path-existence checks before
//! `LlamaModel::load_from_file` in `web/model_manager.rs`, generalized from
//! a single fixed path into the ordered candidate-layout search spec.md
//! requires.

use std::path::{Path, PathBuf};

const DEFAULT_ORG: &str = "mlx-community";

/// Splits a raw id into `(org, name)`, applying the default organization
/// when the id carries none.
pub fn normalize(id: &str) -> String {
    if id.contains('/') {
        id.to_string()
    } else {
        format!("{DEFAULT_ORG}/{id}")
    }
}

fn split_org_name(normalized: &str) -> (&str, &str) {
    match normalized.split_once('/') {
        Some((org, name)) => (org, name),
        None => (DEFAULT_ORG, normalized),
    }
}

pub struct CacheResolver {
    root: PathBuf,
}

impl CacheResolver {
    pub fn new(root: PathBuf) -> Self {
        CacheResolver { root }
    }

    /// The configured root, honoring `MACAFM_MLX_MODEL_CACHE` with a
    /// platform user-cache fallback.
    pub fn from_env() -> Self {
        let root = std::env::var("MACAFM_MLX_MODEL_CACHE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                dirs::cache_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join("afm")
                    .join("models")
            });
        CacheResolver::new(root)
    }

    fn has_weights(dir: &Path) -> bool {
        if !dir.join("config.json").is_file() {
            return false;
        }
        let Ok(entries) = std::fs::read_dir(dir) else {
            return false;
        };
        entries.filter_map(Result::ok).any(|entry| {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            name.ends_with(".safetensors") || name == "model.safetensors.index.json"
        })
    }

    /// Descend into `snapshots/<hash>/` if the candidate is a hub-style
    /// cache directory rather than the weights themselves.
    fn resolve_snapshot(dir: &Path) -> Option<PathBuf> {
        let snapshots = dir.join("snapshots");
        if !snapshots.is_dir() {
            return None;
        }
        std::fs::read_dir(&snapshots)
            .ok()?
            .filter_map(Result::ok)
            .map(|e| e.path())
            .find(|p| p.is_dir() && Self::has_weights(p))
    }

    fn candidates(&self, normalized: &str) -> Vec<PathBuf> {
        let (org, name) = split_org_name(normalized);
        let mut out = vec![
            self.root.join(org).join(name),
            self.root.join("models").join(org).join(name),
            self.root
                .join("huggingface")
                .join("hub")
                .join(format!("models--{org}--{name}")),
        ];
        if let Some(user_cache) = dirs::cache_dir() {
            out.push(
                user_cache
                    .join("huggingface")
                    .join("hub")
                    .join(format!("models--{org}--{name}")),
            );
        }
        if let Some(home) = dirs::home_dir() {
            out.push(
                home.join(".cache")
                    .join("huggingface")
                    .join("hub")
                    .join(format!("models--{org}--{name}")),
            );
        }
        out
    }

    /// Returns the first candidate directory that contains both
    /// `config.json` and weight files, descending into a `snapshots/<hash>`
    /// subtree when present. `None` means "not found" — callers decide
    /// whether to trigger a download.
    pub fn resolve(&self, raw_id: &str) -> Option<PathBuf> {
        let normalized = normalize(raw_id);
        for candidate in self.candidates(&normalized) {
            if let Some(snapshot) = Self::resolve_snapshot(&candidate) {
                return Some(snapshot);
            }
            if Self::has_weights(&candidate) {
                return Some(candidate);
            }
        }
        None
    }

    /// Exports `HF_HOME` / `HUGGINGFACE_HUB_CACHE` so the weight fetcher
    /// honours the configured root.
    pub fn apply_environment(&self) {
        std::env::set_var("HF_HOME", &self.root);
        std::env::set_var("HUGGINGFACE_HUB_CACHE", &self.root);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_adds_default_org() {
        assert_eq!(normalize("phi-3-mini"), "mlx-community/phi-3-mini");
    }

    #[test]
    fn normalize_is_idempotent() {
        // Testable property 1 (spec §8): normalize(normalize(x)) == normalize(x)
        for id in ["phi-3-mini", "mlx-community/foo", "other-org/bar"] {
            let once = normalize(id);
            let twice = normalize(&once);
            assert_eq!(once, twice);
        }
        assert_eq!(normalize("mlx-community/foo"), "mlx-community/foo");
    }

    #[test]
    fn resolve_finds_flat_layout() {
        let tmp = std::env::temp_dir().join(format!("afm-test-{}", uuid::Uuid::new_v4()));
        let model_dir = tmp.join("mlx-community").join("demo-model");
        std::fs::create_dir_all(&model_dir).unwrap();
        std::fs::write(model_dir.join("config.json"), "{}").unwrap();
        std::fs::write(model_dir.join("model.safetensors"), []).unwrap();

        let resolver = CacheResolver::new(tmp.clone());
        assert_eq!(resolver.resolve("demo-model"), Some(model_dir));

        std::fs::remove_dir_all(&tmp).ok();
    }

    #[test]
    fn resolve_returns_none_when_missing() {
        let tmp = std::env::temp_dir().join(format!("afm-test-missing-{}", uuid::Uuid::new_v4()));
        let resolver = CacheResolver::new(tmp);
        assert_eq!(resolver.resolve("nope"), None);
    }

    #[test]
    fn resolve_descends_into_snapshot() {
        let tmp = std::env::temp_dir().join(format!("afm-test-snap-{}", uuid::Uuid::new_v4()));
        let hub_dir = tmp
            .join("huggingface")
            .join("hub")
            .join("models--mlx-community--demo");
        let snap_dir = hub_dir.join("snapshots").join("abc123");
        std::fs::create_dir_all(&snap_dir).unwrap();
        std::fs::write(snap_dir.join("config.json"), "{}").unwrap();
        std::fs::write(snap_dir.join("model.safetensors"), []).unwrap();

        let resolver = CacheResolver::new(tmp.clone());
        assert_eq!(resolver.resolve("demo"), Some(snap_dir));

        std::fs::remove_dir_all(&tmp).ok();
    }
}
