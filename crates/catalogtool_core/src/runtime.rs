use std::collections::HashSet;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use walkdir::WalkDir;

use crate::config::{AssetsSection, CatalogToolConfig, embedded_default_config};

pub const STATE_DIR_NAME: &str = ".catalogtool";
const DATA_DIR_RELATIVE: &str = "src/data";

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
}

impl ResolutionContext {
    pub fn from_process() -> Result<Self> {
        let cwd = env::current_dir().context("failed to read current directory")?;
        Ok(Self { cwd })
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedPaths {
    pub project_root: PathBuf,
    pub data_dir: PathBuf,
    pub state_dir: PathBuf,
    pub config_path: PathBuf,
    pub root_source: ValueSource,
    pub data_source: ValueSource,
    pub config_source: ValueSource,
}

impl ResolvedPaths {
    pub fn products_dir(&self, assets: &AssetsSection) -> PathBuf {
        absolutize(Path::new(&assets.products_dir), &self.project_root)
    }

    pub fn collections_dir(&self, assets: &AssetsSection) -> PathBuf {
        absolutize(Path::new(&assets.collections_dir), &self.project_root)
    }

    pub fn diagnostics(&self) -> String {
        format!(
            "project_root={} ({})\ndata_dir={} ({})\nstate_dir={}\nconfig_path={} ({})",
            normalize_for_display(&self.project_root),
            self.root_source.as_str(),
            normalize_for_display(&self.data_dir),
            self.data_source.as_str(),
            normalize_for_display(&self.state_dir),
            normalize_for_display(&self.config_path),
            self.config_source.as_str(),
        )
    }
}

#[derive(Debug, Clone)]
pub struct CatalogFileStatus {
    pub path: PathBuf,
    pub exists: bool,
    pub size_bytes: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct RuntimeStatus {
    pub project_root_exists: bool,
    pub data_dir_exists: bool,
    pub config_exists: bool,
    pub catalog_files: Vec<CatalogFileStatus>,
    pub products_dir: PathBuf,
    pub product_images: Option<usize>,
    pub collections_dir: PathBuf,
    pub collection_images: Option<usize>,
    pub warnings: Vec<String>,
}

pub fn inspect_runtime(paths: &ResolvedPaths, config: &CatalogToolConfig) -> Result<RuntimeStatus> {
    let mut warnings = Vec::new();

    let data_dir_exists = paths.data_dir.exists();
    if !data_dir_exists {
        warnings.push(format!(
            "data directory {} is missing; pass --data-dir or set CATALOGTOOL_DATA_DIR",
            normalize_for_display(&paths.data_dir)
        ));
    }

    let mut catalog_files = Vec::with_capacity(config.catalog.files.len());
    for spec in &config.catalog.files {
        let path = paths.data_dir.join(&spec.path);
        let size_bytes = if path.exists() {
            let metadata = fs::metadata(&path)
                .with_context(|| format!("failed to inspect {}", path.display()))?;
            Some(metadata.len())
        } else {
            None
        };
        catalog_files.push(CatalogFileStatus {
            exists: size_bytes.is_some(),
            path,
            size_bytes,
        });
    }

    let products_dir = paths.products_dir(&config.assets);
    let collections_dir = paths.collections_dir(&config.assets);
    let product_images = count_files(&products_dir)?;
    let collection_images = count_files(&collections_dir)?;
    if product_images.is_none() || collection_images.is_none() {
        warnings.push(
            "asset directories are missing; run `catalogtool init` before localizing images"
                .to_string(),
        );
    }

    Ok(RuntimeStatus {
        project_root_exists: paths.project_root.exists(),
        data_dir_exists,
        config_exists: paths.config_path.exists(),
        catalog_files,
        products_dir,
        product_images,
        collections_dir,
        collection_images,
        warnings,
    })
}

fn count_files(dir: &Path) -> Result<Option<usize>> {
    if !dir.exists() {
        return Ok(None);
    }
    let mut count = 0usize;
    for entry in WalkDir::new(dir).min_depth(1).max_depth(1) {
        let entry = entry.with_context(|| format!("failed to list {}", dir.display()))?;
        if entry.file_type().is_file() {
            count += 1;
        }
    }
    Ok(Some(count))
}

#[derive(Debug, Clone, Default)]
pub struct InitOptions {
    pub force: bool,
}

#[derive(Debug, Clone)]
pub struct InitReport {
    pub created_dirs: Vec<PathBuf>,
    pub wrote_config: bool,
}

pub fn resolve_paths(
    context: &ResolutionContext,
    overrides: &PathOverrides,
) -> Result<ResolvedPaths> {
    resolve_paths_with_lookup(context, overrides, |key| env::var(key).ok())
}

pub fn resolve_paths_with_lookup<F>(
    context: &ResolutionContext,
    overrides: &PathOverrides,
    lookup_env: F,
) -> Result<ResolvedPaths>
where
    F: Fn(&str) -> Option<String>,
{
    let (project_root, root_source) = resolve_project_root(context, overrides, &lookup_env);
    let state_dir = project_root.join(STATE_DIR_NAME);

    let (data_dir, data_source) = if let Some(path) = overrides.data_dir.as_deref() {
        (absolutize(path, &project_root), ValueSource::Flag)
    } else if let Some(value) = non_blank_env(&lookup_env, "CATALOGTOOL_DATA_DIR") {
        (absolutize(Path::new(&value), &project_root), ValueSource::Env)
    } else {
        (project_root.join(DATA_DIR_RELATIVE), ValueSource::Default)
    };

    let (config_path, config_source) = if let Some(path) = overrides.config.as_deref() {
        (absolutize(path, &project_root), ValueSource::Flag)
    } else if let Some(value) = non_blank_env(&lookup_env, "CATALOGTOOL_CONFIG") {
        (absolutize(Path::new(&value), &project_root), ValueSource::Env)
    } else {
        (state_dir.join("config.toml"), ValueSource::Default)
    };

    Ok(ResolvedPaths {
        project_root,
        data_dir,
        state_dir,
        config_path,
        root_source,
        data_source,
        config_source,
    })
}

/// Create the state and asset directories and materialize the project config.
pub fn init_layout(
    paths: &ResolvedPaths,
    config: &CatalogToolConfig,
    options: &InitOptions,
) -> Result<InitReport> {
    let mut created_dirs = Vec::new();
    let required_dirs = [
        paths.state_dir.clone(),
        paths.products_dir(&config.assets),
        paths.collections_dir(&config.assets),
    ];
    for dir in &required_dirs {
        if !dir.exists() {
            fs::create_dir_all(dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
            created_dirs.push(dir.clone());
        }
    }

    let wrote_config = write_text_file(
        &paths.config_path,
        &render_materialized_config(paths),
        options.force,
    )?;

    Ok(InitReport {
        created_dirs,
        wrote_config,
    })
}

pub fn render_materialized_config(paths: &ResolvedPaths) -> String {
    format!(
        "# catalogtool project configuration (materialized by `catalogtool init`)\n# project_root = \"{}\"\n# data_dir = \"{}\"\n#\n# Every table below overlays the built-in defaults; delete what you do not change.\n\n{}",
        normalize_for_display(&paths.project_root),
        normalize_for_display(&paths.data_dir),
        embedded_default_config()
            .lines()
            .skip_while(|line| line.starts_with('#') || line.trim().is_empty())
            .collect::<Vec<_>>()
            .join("\n"),
    )
}

fn resolve_project_root<F>(
    context: &ResolutionContext,
    overrides: &PathOverrides,
    lookup_env: &F,
) -> (PathBuf, ValueSource)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(path) = overrides.project_root.as_deref() {
        return (absolutize(path, &context.cwd), ValueSource::Flag);
    }
    if let Some(value) = non_blank_env(lookup_env, "CATALOGTOOL_PROJECT_ROOT") {
        return (absolutize(Path::new(&value), &context.cwd), ValueSource::Env);
    }
    match detect_project_root(&context.cwd) {
        Some(root) => (root, ValueSource::Heuristic),
        None => (context.cwd.clone(), ValueSource::Default),
    }
}

/// Nearest ancestor of `cwd` that holds a catalog data directory.
fn detect_project_root(cwd: &Path) -> Option<PathBuf> {
    let mut seen = HashSet::new();
    cwd.ancestors()
        .filter(|candidate| seen.insert(normalize_for_display(candidate)))
        .find(|candidate| candidate.join(DATA_DIR_RELATIVE).is_dir())
        .map(Path::to_path_buf)
}

fn non_blank_env<F>(lookup_env: &F, key: &str) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    lookup_env(key)
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn absolutize(path: &Path, base: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
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

pub fn normalize_for_display(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}
