use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::config::CatalogFileSpec;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Product,
    Collection,
    Page,
    BlogPost,
}

impl EntityKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Product => "product",
            Self::Collection => "collection",
            Self::Page => "page",
            Self::BlogPost => "blog_post",
        }
    }

    pub fn default_content_field(self) -> Option<&'static str> {
        match self {
            Self::Product | Self::Page => Some("body_html"),
            Self::BlogPost => Some("content"),
            Self::Collection => None,
        }
    }
}

/// One catalog document: an ordered array of records of a single kind.
#[derive(Debug, Clone)]
pub struct CatalogFile {
    pub path: PathBuf,
    pub kind: EntityKind,
    pub content_field: Option<String>,
    pub records: Vec<Value>,
    source_hash: String,
    trailing_newline: bool,
}

impl CatalogFile {
    pub fn load(path: &Path, spec: &CatalogFileSpec) -> Result<Self> {
        let content =
            fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
        let parsed: Value = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        let Value::Array(records) = parsed else {
            bail!("{} must contain a top-level JSON array", path.display());
        };
        Ok(Self {
            path: path.to_path_buf(),
            kind: spec.kind,
            content_field: spec.content_field().map(ToString::to_string),
            records,
            source_hash: compute_hash(&content),
            trailing_newline: content.ends_with('\n'),
        })
    }

    pub fn display_name(&self) -> String {
        self.path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| self.path.to_string_lossy().to_string())
    }

    /// Serialize with two-space indentation, raw UTF-8, and the source's trailing newline.
    pub fn render(&self) -> Result<String> {
        let mut rendered = serde_json::to_string_pretty(&self.records)
            .with_context(|| format!("failed to serialize {}", self.path.display()))?;
        if self.trailing_newline {
            rendered.push('\n');
        }
        Ok(rendered)
    }

    /// True when the rendered document differs from what was read.
    pub fn is_dirty(&self) -> Result<bool> {
        Ok(compute_hash(&self.render()?) != self.source_hash)
    }

    /// Write the document atomically if it changed. Returns `true` when a write occurred.
    pub fn persist(&mut self) -> Result<bool> {
        let rendered = self.render()?;
        let hash = compute_hash(&rendered);
        if hash == self.source_hash {
            return Ok(false);
        }
        write_atomic(&self.path, rendered.as_bytes())?;
        self.source_hash = hash;
        Ok(true)
    }
}

#[derive(Debug, Clone, Default)]
pub struct Catalog {
    pub files: Vec<CatalogFile>,
}

impl Catalog {
    /// Read every configured file. Missing files are skipped; unreadable or malformed ones abort.
    pub fn load(data_dir: &Path, specs: &[CatalogFileSpec]) -> Result<Self> {
        let mut files = Vec::with_capacity(specs.len());
        for spec in specs {
            let path = data_dir.join(&spec.path);
            if !path.exists() {
                warn!(path = %path.display(), "catalog file missing; skipping");
                continue;
            }
            let file = CatalogFile::load(&path, spec)?;
            info!(
                path = %path.display(),
                kind = spec.kind.as_str(),
                records = file.records.len(),
                "loaded catalog file"
            );
            files.push(file);
        }
        Ok(Self { files })
    }

    pub fn records(&self, kind: EntityKind) -> impl Iterator<Item = &Value> {
        self.files
            .iter()
            .filter(move |file| file.kind == kind)
            .flat_map(|file| file.records.iter())
    }

    pub fn record_count(&self) -> usize {
        self.files.iter().map(|file| file.records.len()).sum()
    }

    /// Persist every changed file. Returns the paths that were rewritten.
    pub fn persist(&mut self) -> Result<Vec<PathBuf>> {
        let mut written = Vec::new();
        for file in &mut self.files {
            if file.persist()? {
                info!(path = %file.path.display(), "wrote catalog file");
                written.push(file.path.clone());
            }
        }
        Ok(written)
    }
}

/// Non-blank `handle` of a record.
pub fn record_handle(record: &Value) -> Option<&str> {
    record
        .get("handle")
        .and_then(Value::as_str)
        .filter(|handle| !handle.trim().is_empty())
}

pub fn record_title(record: &Value) -> Option<&str> {
    record
        .get("title")
        .and_then(Value::as_str)
        .filter(|title| !title.trim().is_empty())
}

/// Write `bytes` to a sibling temp file, sync it, then rename it over `path`.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("path has no parent: {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("failed to create {}", parent.display()))?;

    let file_name = path
        .file_name()
        .ok_or_else(|| anyhow::anyhow!("path has no file name: {}", path.display()))?;
    let mut temp_name = file_name.to_os_string();
    temp_name.push(".tmp");
    let temp_path = parent.join(temp_name);

    {
        let mut file = File::create(&temp_path)
            .with_context(|| format!("failed to create {}", temp_path.display()))?;
        file.write_all(bytes)
            .with_context(|| format!("failed to write {}", temp_path.display()))?;
        file.sync_all()
            .with_context(|| format!("failed to flush {}", temp_path.display()))?;
    }

    if let Err(error) = fs::rename(&temp_path, path) {
        let _ = fs::remove_file(&temp_path);
        return Err(error).with_context(|| {
            format!(
                "failed to move {} into place at {}",
                temp_path.display(),
                path.display()
            )
        });
    }
    Ok(())
}

fn compute_hash(content: &str) -> String {
    let digest = Sha256::digest(content.as_bytes());
    let mut output = String::with_capacity(64);
    for byte in digest.iter() {
        output.push_str(&format!("{byte:02x}"));
    }
    output
}
