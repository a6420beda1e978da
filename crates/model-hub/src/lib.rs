//! Resolves model identifiers to local directories holding a model's config,
//! weights and tokenizer files, downloading missing files into the Hugging
//! Face hub cache.

pub mod error;

pub use error::{HubError, Result};

use hf_hub::api::sync::{Api, ApiBuilder};
use hf_hub::{Cache, Repo, RepoType};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

pub const CONFIG_FILE: &str = "config.json";
pub const WEIGHTS_FILE: &str = "model.safetensors";
pub const WEIGHTS_INDEX_FILE: &str = "model.safetensors.index.json";
pub const TOKENIZER_FILE: &str = "tokenizer.json";
/// Fetched only when a repo has no `tokenizer.json`.
pub const SLOW_TOKENIZER_FILES: [&str; 2] = ["vocab.json", "merges.txt"];
pub const OPTIONAL_FILES: [&str; 1] = ["tokenizer_config.json"];

/// A model directory on local disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelFiles {
    pub id: String,
    pub dir: PathBuf,
}

impl ModelFiles {
    pub fn path(&self, file: &str) -> PathBuf {
        self.dir.join(file)
    }
}

/// Anything that can turn a model identifier into local files.
pub trait ModelRegistry {
    fn resolve(&self, id: &str) -> Result<ModelFiles>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// Root of the hub cache. Unset means the standard Hugging Face location
    /// shared with every other hub client on the machine.
    pub cache_dir: Option<PathBuf>,
    pub endpoint: String,
    /// Branch, tag or commit. Each revision resolves to its own snapshot.
    pub revision: String,
    /// Never touch the network; uncached files are an error.
    pub offline: bool,
    /// Sent as a bearer token when set.
    pub token: Option<String>,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            cache_dir: None,
            endpoint: "https://huggingface.co".to_string(),
            revision: "main".to_string(),
            offline: false,
            token: None,
        }
    }
}

/// Read-through cache in front of the Hugging Face hub.
///
/// Existing directories are used as they are. Other ids must look like
/// `org/name`; their files are looked up in the hub cache under
/// `models--org--name/snapshots/<commit>/`, where `<commit>` is what
/// `refs/<revision>` points at, and downloaded on a miss.
pub struct HubCache {
    config: HubConfig,
    cache: Cache,
}

impl HubCache {
    pub fn new(config: HubConfig) -> Self {
        let cache = match &config.cache_dir {
            Some(dir) => Cache::new(dir.clone()),
            None => Cache::default(),
        };
        Self { config, cache }
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    pub fn cache_dir(&self) -> &Path {
        self.cache.path()
    }

    pub(crate) fn parse_repo_id(id: &str) -> Result<(&str, &str)> {
        match id.split_once('/') {
            Some((org, name)) if !org.is_empty() && !name.is_empty() && !name.contains('/') => Ok((org, name)),
            _ => Err(HubError::InvalidModelId(id.to_string())),
        }
    }

    fn repo(&self, id: &str) -> Repo {
        Repo::with_revision(id.to_string(), RepoType::Model, self.config.revision.clone())
    }

    fn api(&self) -> Result<Api> {
        let api = ApiBuilder::new()
            .with_cache_dir(self.cache.path().clone())
            .with_endpoint(self.config.endpoint.clone())
            .with_token(self.config.token.clone())
            .build()?;
        Ok(api)
    }

    /// Path of `file` in the snapshot of the configured revision, downloading
    /// it through `api` on a miss.
    fn fetch(&self, id: &str, api: Option<&Api>, file: &str) -> Result<PathBuf> {
        if let Some(path) = self.cache.repo(self.repo(id)).get(file) {
            tracing::debug!(model = id, file, "cache hit");
            return Ok(path);
        }
        let Some(api) = api else {
            return Err(HubError::NotCached {
                model: id.to_string(),
                file: file.to_string(),
            });
        };

        tracing::info!(model = id, file, revision = %self.config.revision, "downloading");
        api.repo(self.repo(id)).get(file).map_err(|e| {
            if e.to_string().contains("404") {
                HubError::FileNotFound {
                    model: id.to_string(),
                    file: file.to_string(),
                }
            } else {
                HubError::Api(e)
            }
        })
    }

    fn fetch_tokenizer(&self, id: &str, api: Option<&Api>) -> Result<()> {
        match self.fetch(id, api, TOKENIZER_FILE) {
            Ok(_) => {}
            Err(HubError::FileNotFound { .. }) | Err(HubError::NotCached { .. }) => {
                for file in SLOW_TOKENIZER_FILES {
                    self.fetch(id, api, file)?;
                }
            }
            Err(e) => return Err(e),
        }
        for file in OPTIONAL_FILES {
            match self.fetch(id, api, file) {
                Ok(_) | Err(HubError::FileNotFound { .. }) | Err(HubError::NotCached { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn fetch_weights(&self, id: &str, api: Option<&Api>) -> Result<()> {
        match self.fetch(id, api, WEIGHTS_FILE) {
            Ok(_) => return Ok(()),
            Err(HubError::FileNotFound { .. }) | Err(HubError::NotCached { .. }) => {}
            Err(e) => return Err(e),
        }

        let index = self.fetch(id, api, WEIGHTS_INDEX_FILE)?;
        for shard in shard_files(&index)? {
            self.fetch(id, api, &shard)?;
        }
        Ok(())
    }
}

/// Distinct shard file names listed in a safetensors index.
pub fn shard_files(index_path: &Path) -> Result<Vec<String>> {
    let index: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(index_path)?)?;
    let shards: BTreeSet<String> = index
        .get("weight_map")
        .and_then(|m| m.as_object())
        .map(|m| m.values().filter_map(|v| v.as_str().map(str::to_string)).collect())
        .unwrap_or_default();
    Ok(shards.into_iter().collect())
}

impl ModelRegistry for HubCache {
    fn resolve(&self, id: &str) -> Result<ModelFiles> {
        let local = Path::new(id);
        if local.is_dir() {
            if !local.join(CONFIG_FILE).exists() {
                return Err(HubError::FileNotFound {
                    model: id.to_string(),
                    file: CONFIG_FILE.to_string(),
                });
            }
            return Ok(ModelFiles {
                id: id.to_string(),
                dir: local.to_path_buf(),
            });
        }

        Self::parse_repo_id(id)?;
        let api = if self.config.offline { None } else { Some(self.api()?) };

        let config = self.fetch(id, api.as_ref(), CONFIG_FILE)?;
        self.fetch_tokenizer(id, api.as_ref())?;
        self.fetch_weights(id, api.as_ref())?;

        // every file of one revision sits in the same snapshot directory
        let dir = config.parent().map(Path::to_path_buf).unwrap_or_default();
        tracing::info!(model = id, revision = %self.config.revision, dir = ?dir, "model resolved");
        Ok(ModelFiles { id: id.to_string(), dir })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offline(cache_dir: &Path, revision: &str) -> HubCache {
        HubCache::new(HubConfig {
            cache_dir: Some(cache_dir.to_path_buf()),
            revision: revision.to_string(),
            offline: true,
            ..Default::default()
        })
    }

    /// Lays out `files` as the hub cache does after downloading `id` at
    /// `revision`, which resolved to `commit`. Returns the snapshot directory.
    fn seed(cache: &Path, id: &str, revision: &str, commit: &str, files: &[&str]) -> PathBuf {
        let repo_dir = cache.join(format!("models--{}", id.replace('/', "--")));
        std::fs::create_dir_all(repo_dir.join("refs")).unwrap();
        std::fs::write(repo_dir.join("refs").join(revision), commit).unwrap();
        let snapshot = repo_dir.join("snapshots").join(commit);
        std::fs::create_dir_all(&snapshot).unwrap();
        for f in files {
            std::fs::write(snapshot.join(f), "{}").unwrap();
        }
        snapshot
    }

    #[test]
    fn repo_ids_need_org_and_name() {
        assert_eq!(HubCache::parse_repo_id("Qwen/Qwen2-0.5B").unwrap(), ("Qwen", "Qwen2-0.5B"));
        assert!(HubCache::parse_repo_id("Qwen2-0.5B").is_err());
        assert!(HubCache::parse_repo_id("a/b/c").is_err());
        assert!(HubCache::parse_repo_id("/b").is_err());
    }

    #[test]
    fn local_directories_are_used_directly() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE), "{}").unwrap();
        let hub = offline(Path::new("/nonexistent"), "main");
        let files = hub.resolve(dir.path().to_str().unwrap()).unwrap();
        assert_eq!(files.dir, dir.path());
    }

    #[test]
    fn cached_models_resolve_offline() {
        let cache = tempfile::tempdir().unwrap();
        let snapshot = seed(cache.path(), "acme/tiny", "main", "abc123", &[CONFIG_FILE, TOKENIZER_FILE, WEIGHTS_FILE]);

        let files = offline(cache.path(), "main").resolve("acme/tiny").unwrap();
        assert_eq!(files.dir, snapshot);
        assert_eq!(files.path(CONFIG_FILE), snapshot.join(CONFIG_FILE));
    }

    #[test]
    fn each_revision_resolves_to_its_own_snapshot() {
        let cache = tempfile::tempdir().unwrap();
        let files = [CONFIG_FILE, TOKENIZER_FILE, WEIGHTS_FILE];
        let main = seed(cache.path(), "acme/tiny", "main", "abc123", &files);
        let pinned = seed(cache.path(), "acme/tiny", "v2.0", "def456", &files);

        let a = offline(cache.path(), "main").resolve("acme/tiny").unwrap();
        let b = offline(cache.path(), "v2.0").resolve("acme/tiny").unwrap();
        assert_eq!(a.dir, main);
        assert_eq!(b.dir, pinned);
        assert_ne!(a.dir, b.dir);

        let err = offline(cache.path(), "v3.0").resolve("acme/tiny").unwrap_err();
        assert!(matches!(err, HubError::NotCached { file, .. } if file == CONFIG_FILE));
    }

    #[test]
    fn slow_tokenizer_files_stand_in_for_tokenizer_json() {
        let cache = tempfile::tempdir().unwrap();
        seed(cache.path(), "acme/slow", "main", "abc", &[CONFIG_FILE, "vocab.json", "merges.txt", WEIGHTS_FILE]);
        assert!(offline(cache.path(), "main").resolve("acme/slow").is_ok());

        seed(cache.path(), "acme/none", "main", "abc", &[CONFIG_FILE, WEIGHTS_FILE]);
        let err = offline(cache.path(), "main").resolve("acme/none").unwrap_err();
        assert!(matches!(err, HubError::NotCached { file, .. } if file == "vocab.json"));
    }

    #[test]
    fn sharded_weights_are_found_through_the_index() {
        let cache = tempfile::tempdir().unwrap();
        let snapshot = seed(
            cache.path(),
            "acme/big",
            "main",
            "abc",
            &[CONFIG_FILE, TOKENIZER_FILE, "a.safetensors", "b.safetensors"],
        );
        let index = serde_json::json!({ "weight_map": { "x": "b.safetensors", "y": "a.safetensors", "z": "b.safetensors" } });
        std::fs::write(snapshot.join(WEIGHTS_INDEX_FILE), index.to_string()).unwrap();

        assert_eq!(shard_files(&snapshot.join(WEIGHTS_INDEX_FILE)).unwrap(), vec!["a.safetensors", "b.safetensors"]);
        assert!(offline(cache.path(), "main").resolve("acme/big").is_ok());
    }

    #[test]
    fn offline_miss_names_the_file() {
        let cache = tempfile::tempdir().unwrap();
        let err = offline(cache.path(), "main").resolve("acme/missing").unwrap_err();
        assert!(matches!(err, HubError::NotCached { file, .. } if file == CONFIG_FILE));
    }

    #[test]
    fn malformed_ids_fail_before_any_io() {
        let cache = tempfile::tempdir().unwrap();
        let err = offline(cache.path(), "main").resolve("not-a-repo-id").unwrap_err();
        assert!(matches!(err, HubError::InvalidModelId(_)));
    }
}
