//! The catalog migration run: rewrite links, localize images, persist, verify.
//!
//! Every catalog file is read and parsed before any record is touched. Records
//! are processed on a bounded worker pool against owned working copies; results
//! are applied back in catalog order once the pool is done, and only then is
//! anything written.

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use rayon::{ThreadPool, ThreadPoolBuilder};
use rayon::prelude::*;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::assets::{AssetLocalizer, AssetSlot, LocalFileIndex, Outcome};
use crate::catalog::{Catalog, CatalogFile, EntityKind, record_handle, record_title};
use crate::config::{AssetsSection, CatalogToolConfig, HttpSettings};
use crate::external::{AssetFetcher, RetryPolicy};
use crate::index::CatalogIndex;
use crate::links::{LinkRewriter, LinkRules};
use crate::preview::FieldPreview;
use crate::redirects::RedirectResolver;
use crate::runtime::ResolvedPaths;

#[derive(Debug, Clone)]
pub struct MigrateOptions {
    pub rewrite_links: bool,
    pub localize_assets: bool,
    /// Fetch missing mirrors; when off, unmatched references are reported as missing.
    pub download: bool,
    /// Compute everything, write nothing, collect field diffs.
    pub dry_run: bool,
    /// Overrides `[http] workers`.
    pub workers: Option<usize>,
}

impl Default for MigrateOptions {
    fn default() -> Self {
        Self {
            rewrite_links: true,
            localize_assets: true,
            download: true,
            dry_run: false,
            workers: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AssetTally {
    pub updated: usize,
    pub downloaded: usize,
    pub failed: usize,
    pub missing: usize,
}

impl AssetTally {
    fn record(&mut self, outcome: &Outcome) {
        match outcome {
            Outcome::AlreadyLocal => {}
            Outcome::Localized { downloaded, .. } => {
                self.updated += 1;
                if *downloaded {
                    self.downloaded += 1;
                }
            }
            Outcome::Failed(_) => self.failed += 1,
            Outcome::Missing => self.missing += 1,
        }
    }

    fn add(&mut self, other: &AssetTally) {
        self.updated += other.updated;
        self.downloaded += other.downloaded;
        self.failed += other.failed;
        self.missing += other.missing;
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct FileReport {
    pub file: String,
    pub kind: Option<EntityKind>,
    pub records: usize,
    pub links_fixed: usize,
    pub assets: AssetTally,
    pub record_failures: usize,
}

/// A record that could not be processed; it is left exactly as it was read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordFailure {
    pub file: String,
    pub position: usize,
    pub handle: Option<String>,
    pub title: Option<String>,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AssetFailure {
    pub file: String,
    pub handle: String,
    pub url: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FileVerification {
    pub file: String,
    /// Image `src` values still on the CDN.
    pub cdn_images: usize,
    /// Hyperlinks still written as absolute URLs on the site's own domain.
    pub legacy_links: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct VerificationReport {
    pub files: Vec<FileVerification>,
}

impl VerificationReport {
    pub fn total(&self) -> usize {
        self.files
            .iter()
            .map(|file| file.cdn_images + file.legacy_links)
            .sum()
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RunReport {
    pub dry_run: bool,
    pub links_fixed: usize,
    pub assets: AssetTally,
    pub files: Vec<FileReport>,
    pub record_failures: Vec<RecordFailure>,
    pub asset_failures: Vec<AssetFailure>,
    pub written: Vec<PathBuf>,
    pub verification: VerificationReport,
    pub previews: Vec<FieldPreview>,
}

impl RunReport {
    pub fn verified_remaining(&self) -> usize {
        self.verification.total()
    }
}

/// Shared, read-only state for one pass over the records.
struct RecordPass<'p> {
    rewriter: Option<LinkRewriter<'p>>,
    localizer: Option<&'p AssetLocalizer<'p>>,
    collect_previews: bool,
}

#[derive(Debug, Default)]
struct RecordChange {
    record: Option<Value>,
    links_fixed: usize,
    assets: AssetTally,
    asset_failures: Vec<(String, String)>,
    field_diffs: Vec<(String, String, String)>,
}

pub fn run_migration(
    paths: &ResolvedPaths,
    config: &CatalogToolConfig,
    settings: &HttpSettings,
    options: &MigrateOptions,
    fetcher: Option<&dyn AssetFetcher>,
) -> Result<RunReport> {
    let mut catalog = Catalog::load(&paths.data_dir, &config.catalog.files)?;
    if catalog.files.is_empty() {
        bail!(
            "no catalog files found under {}",
            paths.data_dir.display()
        );
    }

    let index = CatalogIndex::from_catalog(&catalog, &config.site.extra_collections);
    let rules = LinkRules::from_config(config)?;
    let redirects =
        RedirectResolver::build(&index, &config.redirects.collections, rules.vendor_handle());
    info!(
        products = index.product_count(),
        collections = index.collection_count(),
        pages = index.page_count(),
        redirects = redirects.len(),
        "built catalog index"
    );

    let products = LocalFileIndex::scan(&paths.products_dir(&config.assets))?;
    let collections = LocalFileIndex::scan(&paths.collections_dir(&config.assets))?;
    let fetcher = if options.download && !options.dry_run {
        fetcher
    } else {
        None
    };
    let localizer = AssetLocalizer::new(
        &config.assets,
        &products,
        &collections,
        fetcher,
        RetryPolicy::from_settings(settings),
    );

    let workers = options.workers.unwrap_or(settings.workers).max(1);
    let pool = ThreadPoolBuilder::new()
        .num_threads(workers)
        .build()
        .context("failed to start worker pool")?;

    let pass = RecordPass {
        rewriter: options
            .rewrite_links
            .then(|| LinkRewriter::new(&rules, &index, &redirects)),
        localizer: options.localize_assets.then_some(&localizer),
        collect_previews: options.dry_run,
    };

    let mut report = RunReport {
        dry_run: options.dry_run,
        ..RunReport::default()
    };
    for file in &mut catalog.files {
        let file_report = migrate_file(&pool, file, &pass, &mut report);
        info!(
            file = %file_report.file,
            links_fixed = file_report.links_fixed,
            assets_updated = file_report.assets.updated,
            assets_downloaded = file_report.assets.downloaded,
            assets_failed = file_report.assets.failed,
            "processed catalog file"
        );
        report.links_fixed += file_report.links_fixed;
        report.assets.add(&file_report.assets);
        report.files.push(file_report);
    }

    if options.dry_run {
        report.verification = verify_catalog(&catalog, &rules, &config.assets);
    } else {
        report.written = catalog.persist()?;
        report.verification = run_verification(paths, config)?;
    }
    Ok(report)
}

fn migrate_file(
    pool: &ThreadPool,
    file: &mut CatalogFile,
    pass: &RecordPass<'_>,
    report: &mut RunReport,
) -> FileReport {
    let name = file.display_name();
    let kind = file.kind;
    let content_field = file.content_field.clone();
    let records = &file.records;
    let results: Vec<Result<RecordChange>> = pool.install(|| {
        records
            .par_iter()
            .map(|record| process_record(record, kind, content_field.as_deref(), pass))
            .collect()
    });

    let mut file_report = FileReport {
        file: name.clone(),
        kind: Some(kind),
        records: file.records.len(),
        ..FileReport::default()
    };

    for (position, result) in results.into_iter().enumerate() {
        let handle = record_handle(&file.records[position]).map(ToString::to_string);
        match result {
            Ok(change) => {
                file_report.links_fixed += change.links_fixed;
                file_report.assets.add(&change.assets);
                for (url, reason) in change.asset_failures {
                    report.asset_failures.push(AssetFailure {
                        file: name.clone(),
                        handle: handle.clone().unwrap_or_default(),
                        url,
                        reason,
                    });
                }
                for (field, before, after) in change.field_diffs {
                    report.previews.push(FieldPreview::new(
                        &name,
                        handle.as_deref(),
                        &field,
                        &before,
                        &after,
                    ));
                }
                if let Some(updated) = change.record {
                    file.records[position] = updated;
                }
            }
            Err(error) => {
                let record = &file.records[position];
                warn!(
                    file = %name,
                    position,
                    handle = handle.as_deref().unwrap_or("<none>"),
                    error = %error,
                    "record skipped"
                );
                file_report.record_failures += 1;
                report.record_failures.push(RecordFailure {
                    file: name.clone(),
                    position,
                    handle,
                    title: record_title(record).map(ToString::to_string),
                    error: format!("{error:#}"),
                });
            }
        }
    }
    file_report
}

fn process_record(
    record: &Value,
    kind: EntityKind,
    content_field: Option<&str>,
    pass: &RecordPass<'_>,
) -> Result<RecordChange> {
    let Value::Object(fields) = record else {
        bail!("record is not a JSON object");
    };
    let mut working = fields.clone();
    let mut change = RecordChange::default();

    if let (Some(rewriter), Some(field)) = (pass.rewriter, content_field)
        && let Some((before, after, changes)) = rewrite_content(&mut working, field, &rewriter)?
    {
        change.links_fixed += changes;
        if pass.collect_previews {
            change.field_diffs.push((field.to_string(), before, after));
        }
    }

    if let (Some(localizer), Some(handle)) = (pass.localizer, record_handle(record)) {
        localize_images(&mut working, kind, handle, localizer, &mut change)?;
    }

    if change.links_fixed > 0 || change.assets.updated > 0 {
        change.record = Some(Value::Object(working));
    }
    Ok(change)
}

/// Returns `(before, after, changes)` when the field was rewritten.
fn rewrite_content(
    fields: &mut Map<String, Value>,
    field: &str,
    rewriter: &LinkRewriter<'_>,
) -> Result<Option<(String, String, usize)>> {
    let html = match fields.get_mut(field) {
        None | Some(Value::Null) => return Ok(None),
        Some(Value::String(html)) => html,
        Some(_) => bail!("content field `{field}` is not a string"),
    };
    let rewrite = rewriter.rewrite(html.as_str());
    if rewrite.changes == 0 {
        return Ok(None);
    }
    let changes = rewrite.changes;
    let after = rewrite.html.into_owned();
    let before = std::mem::replace(html, after.clone());
    Ok(Some((before, after, changes)))
}

fn localize_images(
    fields: &mut Map<String, Value>,
    kind: EntityKind,
    handle: &str,
    localizer: &AssetLocalizer<'_>,
    change: &mut RecordChange,
) -> Result<()> {
    match kind {
        EntityKind::Product => match fields.get_mut("images") {
            None | Some(Value::Null) => {}
            Some(Value::Array(images)) => {
                for (position, image) in images.iter_mut().enumerate() {
                    let Value::Object(image) = image else {
                        bail!("images[{position}] is not an object");
                    };
                    localize_src(image, handle, AssetSlot::Product(position), localizer, change);
                }
            }
            Some(_) => bail!("`images` is not an array"),
        },
        EntityKind::Collection => match fields.get_mut("image") {
            None | Some(Value::Null) => {}
            Some(Value::Object(image)) => {
                localize_src(image, handle, AssetSlot::CollectionCover, localizer, change);
            }
            Some(_) => bail!("`image` is not an object"),
        },
        EntityKind::Page | EntityKind::BlogPost => {}
    }
    Ok(())
}

fn localize_src(
    image: &mut Map<String, Value>,
    handle: &str,
    slot: AssetSlot,
    localizer: &AssetLocalizer<'_>,
    change: &mut RecordChange,
) {
    let Some(src) = image.get("src").and_then(Value::as_str) else {
        return;
    };
    let outcome = localizer.localize(src, handle, slot);
    change.assets.record(&outcome);
    match outcome {
        Outcome::Localized { path, .. } => {
            image.insert("src".to_string(), Value::String(path));
        }
        Outcome::Failed(reason) => change.asset_failures.push((src.to_string(), reason)),
        Outcome::AlreadyLocal | Outcome::Missing => {}
    }
}

/// Re-read the persisted catalog and count references the run could not fix.
pub fn run_verification(
    paths: &ResolvedPaths,
    config: &CatalogToolConfig,
) -> Result<VerificationReport> {
    let catalog = Catalog::load(&paths.data_dir, &config.catalog.files)?;
    let rules = LinkRules::from_config(config)?;
    Ok(verify_catalog(&catalog, &rules, &config.assets))
}

pub fn verify_catalog(
    catalog: &Catalog,
    rules: &LinkRules,
    assets: &AssetsSection,
) -> VerificationReport {
    let files = catalog
        .files
        .iter()
        .map(|file| {
            let mut verification = FileVerification {
                file: file.display_name(),
                ..FileVerification::default()
            };
            for record in &file.records {
                verification.cdn_images += image_sources(record, file.kind)
                    .filter(|src| assets.is_remote(src))
                    .count();
                if let Some(html) = file
                    .content_field
                    .as_deref()
                    .and_then(|field| record.get(field))
                    .and_then(Value::as_str)
                {
                    verification.legacy_links += rules
                        .hrefs(html)
                        .filter(|href| {
                            rules.is_own_domain(&html_escape::decode_html_entities(href))
                        })
                        .count();
                }
            }
            verification
        })
        .collect();
    VerificationReport { files }
}

fn image_sources(record: &Value, kind: EntityKind) -> Box<dyn Iterator<Item = &str> + '_> {
    match kind {
        EntityKind::Product => Box::new(
            record
                .get("images")
                .and_then(Value::as_array)
                .into_iter()
                .flatten()
                .filter_map(|image| image.get("src").and_then(Value::as_str)),
        ),
        EntityKind::Collection => Box::new(
            record
                .get("image")
                .and_then(|image| image.get("src"))
                .and_then(Value::as_str)
                .into_iter(),
        ),
        EntityKind::Page | EntityKind::BlogPost => Box::new(std::iter::empty()),
    }
}
