use std::collections::HashSet;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use walkdir::WalkDir;

use crate::config::BlobtrackConfig;

pub const STATE_DIR_NAME: &str = ".blobtrack";
pub const LOCAL_DB_FILENAME: &str = "wiki.db";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueSource {
    Flag,
    Env,
    Heuristic,
    Default,
}

impl ValueSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Flag => "flag",
            Self::Env => "env",
            Self::Heuristic => "heuristic",
            Self::Default => "default",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PathOverrides {
    pub project_root: Option<PathBuf>,
    pub data_dir: Option<PathBuf>,
    pub config: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct ResolutionContext {
    pub cwd: PathBuf,
    pub executable_dir: Option<PathBuf>,
}

impl ResolutionContext {
    pub fn from_process() -> Result<Self> {
        let cwd = env::current_dir().context("failed to read current directory")?;
        let executable_dir = env::current_exe()
            .ok()
            .and_then(|path| path.parent().map(Path::to_path_buf));
        Ok(Self {
            cwd,
            executable_dir,
        })
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedPaths {
    pub project_root: PathBuf,
    pub state_dir: PathBuf,
    pub data_dir: PathBuf,
    pub db_path: PathBuf,
    pub cluster_dir: PathBuf,
    pub config_path: PathBuf,
    pub root_source: ValueSource,
    pub data_source: ValueSource,
    pub config_source: ValueSource,
}

impl ResolvedPaths {
    pub fn diagnostics(&self) -> String {
        format!(
            "project_root={} ({})\nstate_dir={}\ndata_dir={} ({})\ndb_path={}\ncluster_dir={}\nconfig_path={} ({})",
            normalize_for_display(&self.project_root),
            self.root_source.as_str(),
            normalize_for_display(&self.state_dir),
            normalize_for_display(&self.data_dir),
            self.data_source.as_str(),
            normalize_for_display(&self.db_path),
            normalize_for_display(&self.cluster_dir),
            normalize_for_display(&self.config_path),
            self.config_source.as_str(),
        )
    }
}

#[derive(Debug, Clone)]
pub struct ClusterFileStatus {
    pub name: String,
    pub path: PathBuf,
    pub available: bool,
}

#[derive(Debug, Clone)]
pub struct RuntimeStatus {
    pub project_root_exists: bool,
    pub state_dir_exists: bool,
    pub data_dir_exists: bool,
    pub db_exists: bool,
    pub db_size_bytes: Option<u64>,
    pub config_exists: bool,
    pub clusters: Vec<ClusterFileStatus>,
    pub warnings: Vec<String>,
}

pub fn resolve_paths(
    context: &ResolutionContext,
    overrides: &PathOverrides,
) -> Result<ResolvedPaths> {
    resolve_paths_with_lookup(context, overrides, |key| env::var(key).ok())
}

fn resolve_paths_with_lookup<F>(
    context: &ResolutionContext,
    overrides: &PathOverrides,
    lookup_env: F,
) -> Result<ResolvedPaths>
where
    F: Fn(&str) -> Option<String>,
{
    let (project_root, root_source) = resolve_project_root(context, overrides, &lookup_env)
        .context("failed to resolve project root")?;

    let state_dir = project_root.join(STATE_DIR_NAME);

    let (data_dir, data_source) = if let Some(path) = overrides.data_dir.as_deref() {
        (
            absolutize_from_project(path, &project_root),
            ValueSource::Flag,
        )
    } else if let Some(value) = lookup_env("BLOBTRACK_DATA_DIR") {
        (
            absolutize_from_project(Path::new(value.trim()), &project_root),
            ValueSource::Env,
        )
    } else {
        (state_dir.join("data"), ValueSource::Default)
    };

    let (config_path, config_source) = if let Some(path) = overrides.config.as_deref() {
        (
            absolutize_from_project(path, &project_root),
            ValueSource::Flag,
        )
    } else if let Some(value) = lookup_env("BLOBTRACK_CONFIG") {
        (
            absolutize_from_project(Path::new(value.trim()), &project_root),
            ValueSource::Env,
        )
    } else {
        (state_dir.join("config.toml"), ValueSource::Default)
    };

    Ok(ResolvedPaths {
        db_path: data_dir.join(LOCAL_DB_FILENAME),
        cluster_dir: data_dir.join("clusters"),
        project_root,
        state_dir,
        data_dir,
        config_path,
        root_source,
        data_source,
        config_source,
    })
}

#[derive(Debug, Clone)]
pub struct InitOptions {
    pub materialize_config: bool,
    pub force: bool,
}

impl Default for InitOptions {
    fn default() -> Self {
        Self {
            materialize_config: true,
            force: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct InitReport {
    pub created_dirs: Vec<PathBuf>,
    pub wrote_config: bool,
}

pub fn init_layout(paths: &ResolvedPaths, options: &InitOptions) -> Result<InitReport> {
    let mut created_dirs = Vec::new();

    let required_dirs = [
        paths.state_dir.clone(),
        paths.data_dir.clone(),
        paths.cluster_dir.clone(),
    ];
    for dir in &required_dirs {
        if !dir.exists() {
            fs::create_dir_all(dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
            created_dirs.push(dir.clone());
        }
    }

    let wrote_config = if options.materialize_config {
        write_text_file(
            &paths.config_path,
            &crate::config::default_config_contents(),
            options.force,
        )?
    } else {
        false
    };

    Ok(InitReport {
        created_dirs,
        wrote_config,
    })
}

pub fn inspect_runtime(paths: &ResolvedPaths, config: &BlobtrackConfig) -> Result<RuntimeStatus> {
    let project_root_exists = paths.project_root.exists();
    let state_dir_exists = paths.state_dir.exists();
    let data_dir_exists = paths.data_dir.exists();
    let config_exists = paths.config_path.exists();
    let db_exists = paths.db_path.exists();
    let db_size_bytes = if db_exists {
        let metadata = fs::metadata(&paths.db_path)
            .with_context(|| format!("failed to inspect {}", paths.db_path.display()))?;
        Some(metadata.len())
    } else {
        None
    };

    let mut clusters = Vec::new();
    for entry in &config.clusters {
        let path = entry.db_path(paths);
        clusters.push(ClusterFileStatus {
            name: entry.name.clone(),
            available: path.exists(),
            path,
        });
    }

    let mut warnings = Vec::new();
    if !state_dir_exists {
        warnings.push(format!(
            "{STATE_DIR_NAME}/ is missing; run `blobtrack init` before tracking commands"
        ));
    }
    for cluster in &clusters {
        if !cluster.available {
            warnings.push(format!(
                "cluster {} has no database file at {}",
                cluster.name,
                normalize_for_display(&cluster.path)
            ));
        }
    }
    for stray in stray_cluster_files(paths, config)? {
        warnings.push(format!(
            "cluster file {stray}.db is not registered in {}",
            normalize_for_display(&paths.config_path)
        ));
    }

    Ok(RuntimeStatus {
        project_root_exists,
        state_dir_exists,
        data_dir_exists,
        db_exists,
        db_size_bytes,
        config_exists,
        clusters,
        warnings,
    })
}

/// Names of `*.db` files in the cluster directory that no configured cluster
/// accounts for.
fn stray_cluster_files(paths: &ResolvedPaths, config: &BlobtrackConfig) -> Result<Vec<String>> {
    if !paths.cluster_dir.exists() {
        return Ok(Vec::new());
    }

    let registered: HashSet<PathBuf> = config
        .clusters
        .iter()
        .map(|entry| entry.db_path(paths))
        .collect();

    let mut strays = Vec::new();
    for entry in WalkDir::new(&paths.cluster_dir).min_depth(1).max_depth(1) {
        let entry = entry.with_context(|| {
            format!("failed to scan {}", paths.cluster_dir.display())
        })?;
        let path = entry.path();
        if !entry.file_type().is_file() || path.extension().is_none_or(|ext| ext != "db") {
            continue;
        }
        if registered.contains(path) {
            continue;
        }
        if let Some(stem) = path.file_stem() {
            strays.push(stem.to_string_lossy().to_string());
        }
    }
    strays.sort();
    Ok(strays)
}

fn resolve_project_root<F>(
    context: &ResolutionContext,
    overrides: &PathOverrides,
    lookup_env: &F,
) -> Result<(PathBuf, ValueSource)>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(path) = overrides.project_root.as_deref() {
        return Ok((absolutize(path, &context.cwd), ValueSource::Flag));
    }

    if let Some(value) = lookup_env("BLOBTRACK_PROJECT_ROOT") {
        return Ok((
            absolutize(Path::new(value.trim()), &context.cwd),
            ValueSource::Env,
        ));
    }

    let root = detect_project_root_heuristic(&context.cwd, context.executable_dir.as_deref());
    Ok((root, ValueSource::Heuristic))
}

fn detect_project_root_heuristic(cwd: &Path, executable_dir: Option<&Path>) -> PathBuf {
    let mut seen = HashSet::new();
    for candidate in candidate_roots(cwd, executable_dir) {
        let key = normalize_for_display(&candidate);
        if !seen.insert(key) {
            continue;
        }
        if candidate.join(STATE_DIR_NAME).exists() {
            return candidate;
        }
    }
    cwd.to_path_buf()
}

fn candidate_roots(cwd: &Path, executable_dir: Option<&Path>) -> Vec<PathBuf> {
    let mut out = ancestors(cwd);
    if let Some(exe_dir) = executable_dir {
        out.extend(ancestors(exe_dir));
    }
    out
}

fn ancestors(path: &Path) -> Vec<PathBuf> {
    let mut out = Vec::new();
    let mut cursor = Some(path);
    while let Some(current) = cursor {
        out.push(current.to_path_buf());
        cursor = current.parent();
    }
    out
}

fn absolutize(path: &Path, base: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

fn absolutize_from_project(path: &Path, project_root: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        project_root.join(path)
    }
}

fn write_text_file(path: &Path, content: &str, force: bool) -> Result<bool> {
    if path.exists() && !force {
        return Ok(false);
    }

    let parent = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("path has no parent: {}", path.display()))?;
    fs::create_dir_all(parent)
        .with_context(|| format!("failed to create parent directory {}", parent.display()))?;
    fs::write(path, content).with_context(|| format!("failed to write {}", path.display()))?;
    Ok(true)
}

fn normalize_for_display(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

/// Resolved layout rooted at an arbitrary directory, for fixture setup.
#[cfg(test)]
pub(crate) fn test_paths(root: &Path) -> ResolvedPaths {
    let context = ResolutionContext {
        cwd: root.to_path_buf(),
        executable_dir: None,
    };
    let overrides = PathOverrides {
        project_root: Some(root.to_path_buf()),
        ..PathOverrides::default()
    };
    resolve_paths_with_lookup(&context, &overrides, |_| None).expect("resolve test paths")
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::fs;

    use tempfile::tempdir;

    use super::{
        InitOptions, PathOverrides, ResolutionContext, ValueSource, init_layout, inspect_runtime,
        resolve_paths_with_lookup, test_paths,
    };
    use crate::config::{BlobtrackConfig, ClusterEntry};

    #[test]
    fn resolve_paths_prefers_flag_over_env() {
        let temp = tempdir().expect("tempdir");
        let cwd = temp.path().join("cwd");
        let from_flag = temp.path().join("flag-root");
        fs::create_dir_all(&cwd).expect("create cwd");

        let overrides = PathOverrides {
            project_root: Some(from_flag.clone()),
            ..PathOverrides::default()
        };
        let context = ResolutionContext {
            cwd: cwd.clone(),
            executable_dir: None,
        };

        let env = HashMap::from([(
            "BLOBTRACK_PROJECT_ROOT".to_string(),
            temp.path().join("env-root").to_string_lossy().to_string(),
        )]);

        let resolved = resolve_paths_with_lookup(&context, &overrides, |key| env.get(key).cloned())
            .expect("resolve paths");
        assert_eq!(resolved.project_root, from_flag);
        assert_eq!(resolved.root_source, ValueSource::Flag);
    }

    #[test]
    fn resolve_paths_uses_env_when_no_flag() {
        let temp = tempdir().expect("tempdir");
        let cwd = temp.path().join("cwd");
        fs::create_dir_all(&cwd).expect("create cwd");
        let env_root = temp.path().join("env-root");

        let context = ResolutionContext {
            cwd,
            executable_dir: None,
        };
        let env = HashMap::from([(
            "BLOBTRACK_PROJECT_ROOT".to_string(),
            env_root.to_string_lossy().to_string(),
        )]);

        let resolved =
            resolve_paths_with_lookup(&context, &PathOverrides::default(), |key| {
                env.get(key).cloned()
            })
            .expect("resolve paths");
        assert_eq!(resolved.project_root, env_root);
        assert_eq!(resolved.root_source, ValueSource::Env);
        assert_eq!(resolved.data_source, ValueSource::Default);
    }

    #[test]
    fn heuristic_finds_state_dir_in_ancestor() {
        let temp = tempdir().expect("tempdir");
        let root = temp.path().join("project");
        let nested = root.join("a").join("b");
        fs::create_dir_all(root.join(super::STATE_DIR_NAME)).expect("create state dir");
        fs::create_dir_all(&nested).expect("create nested");

        let context = ResolutionContext {
            cwd: nested,
            executable_dir: None,
        };
        let resolved = resolve_paths_with_lookup(&context, &PathOverrides::default(), |_| None)
            .expect("resolve paths");
        assert_eq!(resolved.project_root, root);
        assert_eq!(resolved.root_source, ValueSource::Heuristic);
    }

    #[test]
    fn init_layout_creates_dirs_and_config() {
        let temp = tempdir().expect("tempdir");
        let root = temp.path().join("project");
        fs::create_dir_all(&root).expect("create root");
        let paths = test_paths(&root);

        let report = init_layout(&paths, &InitOptions::default()).expect("init");
        assert!(!report.created_dirs.is_empty());
        assert!(report.wrote_config);
        assert!(paths.state_dir.exists());
        assert!(paths.data_dir.exists());
        assert!(paths.cluster_dir.exists());
        assert!(paths.config_path.exists());

        // Second run is a no-op without --force.
        let rerun = init_layout(&paths, &InitOptions::default()).expect("re-init");
        assert!(rerun.created_dirs.is_empty());
        assert!(!rerun.wrote_config);
    }

    #[test]
    fn inspect_runtime_warns_when_uninitialized() {
        let temp = tempdir().expect("tempdir");
        let root = temp.path().join("project");
        fs::create_dir_all(&root).expect("create root");
        let paths = test_paths(&root);

        let status =
            inspect_runtime(&paths, &BlobtrackConfig::default()).expect("inspect");
        assert!(!status.state_dir_exists);
        assert!(!status.db_exists);
        assert!(status.warnings.iter().any(|w| w.contains("blobtrack init")));
    }

    #[test]
    fn inspect_runtime_reports_cluster_availability_and_strays() {
        let temp = tempdir().expect("tempdir");
        let root = temp.path().join("project");
        fs::create_dir_all(&root).expect("create root");
        let paths = test_paths(&root);
        init_layout(&paths, &InitOptions::default()).expect("init");

        let config = BlobtrackConfig {
            clusters: vec![
                ClusterEntry {
                    name: "cluster1".to_string(),
                    path: None,
                },
                ClusterEntry {
                    name: "cluster2".to_string(),
                    path: None,
                },
            ],
            ..BlobtrackConfig::default()
        };
        fs::write(paths.cluster_dir.join("cluster1.db"), b"").expect("cluster1 file");
        fs::write(paths.cluster_dir.join("rogue.db"), b"").expect("stray file");

        let status = inspect_runtime(&paths, &config).expect("inspect");
        let available: Vec<_> = status
            .clusters
            .iter()
            .map(|c| (c.name.as_str(), c.available))
            .collect();
        assert_eq!(available, vec![("cluster1", true), ("cluster2", false)]);
        assert!(status.warnings.iter().any(|w| w.contains("cluster2")));
        assert!(
            status
                .warnings
                .iter()
                .any(|w| w.contains("rogue.db") && w.contains("not registered"))
        );
    }
}
