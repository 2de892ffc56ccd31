use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::runtime::ResolvedPaths;

pub const DEFAULT_WIKI_ID: &str = "main";
pub const DEFAULT_BATCH_SIZE: usize = 1000;
pub const DEFAULT_REPORT_INTERVAL: usize = 10;
pub const DEFAULT_REPLICA_WAIT_TIMEOUT_MS: u64 = 10_000;

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct BlobtrackConfig {
    #[serde(default)]
    pub wiki: WikiSection,
    #[serde(default)]
    pub database: DatabaseSection,
    #[serde(default)]
    pub clusters: Vec<ClusterEntry>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct WikiSection {
    pub id: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct DatabaseSection {
    pub batch_size: Option<usize>,
    pub report_interval: Option<usize>,
    pub replica_wait_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct ClusterEntry {
    pub name: String,
    /// Database file for this cluster, relative to the data directory.
    /// Defaults to `clusters/<name>.db`.
    pub path: Option<String>,
}

impl ClusterEntry {
    pub fn db_path(&self, paths: &ResolvedPaths) -> PathBuf {
        match &self.path {
            Some(path) if Path::new(path).is_absolute() => PathBuf::from(path),
            Some(path) => paths.data_dir.join(path),
            None => paths.cluster_dir.join(format!("{}.db", self.name)),
        }
    }
}

impl BlobtrackConfig {
    /// Resolve the wiki identity used in cache keys: env BLOBTRACK_WIKI_ID >
    /// config > DEFAULT_WIKI_ID.
    pub fn wiki_id(&self) -> String {
        if let Ok(value) = env::var("BLOBTRACK_WIKI_ID") {
            let trimmed = value.trim().to_string();
            if !trimmed.is_empty() {
                return trimmed;
            }
        }
        self.wiki
            .id
            .clone()
            .unwrap_or_else(|| DEFAULT_WIKI_ID.to_string())
    }

    pub fn batch_size(&self) -> usize {
        self.database.batch_size.unwrap_or(DEFAULT_BATCH_SIZE)
    }

    pub fn report_interval(&self) -> usize {
        self.database
            .report_interval
            .unwrap_or(DEFAULT_REPORT_INTERVAL)
    }

    pub fn replica_wait_timeout_ms(&self) -> u64 {
        self.database
            .replica_wait_timeout_ms
            .unwrap_or(DEFAULT_REPLICA_WAIT_TIMEOUT_MS)
    }

    pub fn cluster_names(&self) -> Vec<String> {
        self.clusters
            .iter()
            .map(|cluster| cluster.name.clone())
            .collect()
    }

    pub fn find_cluster(&self, name: &str) -> Option<&ClusterEntry> {
        self.clusters.iter().find(|cluster| cluster.name == name)
    }

    /// Validate an operator-supplied cluster selection against the configured
    /// set. An unknown name is a hard error, not a skip.
    pub fn ensure_known_clusters(&self, requested: &[String]) -> Result<()> {
        for name in requested {
            if self.find_cluster(name).is_none() {
                let known = self.cluster_names().join(", ");
                if known.is_empty() {
                    bail!("unknown cluster {name}: no clusters are configured");
                }
                bail!("unknown cluster {name} (configured: {known})");
            }
        }
        Ok(())
    }

    /// Database file for a configured cluster by name.
    pub fn cluster_db_path(&self, paths: &ResolvedPaths, name: &str) -> Result<PathBuf> {
        let entry = self
            .find_cluster(name)
            .with_context(|| format!("unknown cluster {name}"))?;
        Ok(entry.db_path(paths))
    }
}

/// Load and parse a BlobtrackConfig from a TOML file. Returns default if the
/// file doesn't exist.
pub fn load_config(config_path: &Path) -> Result<BlobtrackConfig> {
    if !config_path.exists() {
        return Ok(BlobtrackConfig::default());
    }
    let content = fs::read_to_string(config_path)
        .with_context(|| format!("failed to read {}", config_path.display()))?;
    let parsed: BlobtrackConfig = toml::from_str(&content)
        .with_context(|| format!("failed to parse {}", config_path.display()))?;
    Ok(parsed)
}

/// Config file contents written by `blobtrack init`.
pub fn default_config_contents() -> String {
    format!(
        "# blobtrack runtime configuration (materialized by `blobtrack init`)\n\n\
[wiki]\nid = \"{DEFAULT_WIKI_ID}\"\n\n\
[database]\nbatch_size = {DEFAULT_BATCH_SIZE}\nreport_interval = {DEFAULT_REPORT_INTERVAL}\nreplica_wait_timeout_ms = {DEFAULT_REPLICA_WAIT_TIMEOUT_MS}\n\n\
# One entry per external storage cluster.\n\
[[clusters]]\nname = \"cluster1\"\n"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::test_paths;
    use tempfile::tempdir;

    #[test]
    fn default_config_has_no_clusters() {
        let config = BlobtrackConfig::default();
        assert!(config.clusters.is_empty());
        assert_eq!(config.batch_size(), DEFAULT_BATCH_SIZE);
        assert_eq!(config.report_interval(), DEFAULT_REPORT_INTERVAL);
    }

    #[test]
    fn load_config_returns_default_for_missing_file() {
        let config = load_config(Path::new("/nonexistent/config.toml")).expect("load config");
        assert!(config.clusters.is_empty());
        assert_eq!(config.wiki_id(), DEFAULT_WIKI_ID);
    }

    #[test]
    fn load_config_parses_all_sections() {
        let temp = tempdir().expect("tempdir");
        let config_path = temp.path().join("config.toml");
        fs::write(
            &config_path,
            r#"
[wiki]
id = "enwiki"

[database]
batch_size = 200
report_interval = 5

[[clusters]]
name = "cluster1"

[[clusters]]
name = "cluster2"
path = "extra/cluster2.db"
"#,
        )
        .expect("write config");

        let config = load_config(&config_path).expect("load config");
        assert_eq!(config.wiki.id.as_deref(), Some("enwiki"));
        assert_eq!(config.batch_size(), 200);
        assert_eq!(config.report_interval(), 5);
        assert_eq!(
            config.replica_wait_timeout_ms(),
            DEFAULT_REPLICA_WAIT_TIMEOUT_MS
        );
        assert_eq!(config.cluster_names(), vec!["cluster1", "cluster2"]);
    }

    #[test]
    fn load_config_tolerates_partial_toml() {
        let temp = tempdir().expect("tempdir");
        let config_path = temp.path().join("config.toml");
        fs::write(&config_path, "[database]\nbatch_size = 50\n").expect("write config");

        let config = load_config(&config_path).expect("load config");
        assert_eq!(config.batch_size(), 50);
        assert!(config.clusters.is_empty());
    }

    #[test]
    fn load_config_returns_error_for_invalid_toml() {
        let temp = tempdir().expect("tempdir");
        let config_path = temp.path().join("config.toml");
        fs::write(&config_path, "[wiki\nid = \"oops\"").expect("write config");
        let error = load_config(&config_path).expect_err("must fail");
        assert!(error.to_string().contains("failed to parse"));
    }

    #[test]
    fn cluster_path_defaults_under_cluster_dir() {
        let temp = tempdir().expect("tempdir");
        let paths = test_paths(temp.path());
        let entry = ClusterEntry {
            name: "cluster1".to_string(),
            path: None,
        };
        assert_eq!(entry.db_path(&paths), paths.cluster_dir.join("cluster1.db"));
    }

    #[test]
    fn cluster_path_override_is_relative_to_data_dir() {
        let temp = tempdir().expect("tempdir");
        let paths = test_paths(temp.path());
        let entry = ClusterEntry {
            name: "cluster2".to_string(),
            path: Some("extra/c2.db".to_string()),
        };
        assert_eq!(entry.db_path(&paths), paths.data_dir.join("extra/c2.db"));
    }

    #[test]
    fn unknown_cluster_selection_is_rejected() {
        let temp = tempdir().expect("tempdir");
        let config_path = temp.path().join("config.toml");
        fs::write(&config_path, "[[clusters]]\nname = \"cluster1\"\n").expect("write config");
        let config = load_config(&config_path).expect("load config");

        config
            .ensure_known_clusters(&["cluster1".to_string()])
            .expect("known cluster");
        let error = config
            .ensure_known_clusters(&["cluster9".to_string()])
            .expect_err("must fail");
        assert!(error.to_string().contains("unknown cluster cluster9"));
        assert!(error.to_string().contains("cluster1"));
    }

    #[test]
    fn default_config_contents_parse_back() {
        let config: BlobtrackConfig =
            toml::from_str(&default_config_contents()).expect("parse default config");
        assert_eq!(config.wiki.id.as_deref(), Some(DEFAULT_WIKI_ID));
        assert_eq!(config.cluster_names(), vec!["cluster1"]);
    }
}
