use std::collections::HashMap;

use anyhow::Result;
use serde::Serialize;
use serde_json::Value;

use crate::assets::{AssetSlot, LocalFileIndex, file_stem};
use crate::catalog::{Catalog, EntityKind, record_handle, record_title};
use crate::config::{AssetsSection, CatalogToolConfig};
use crate::runtime::ResolvedPaths;

#[derive(Debug, Clone, Copy)]
pub struct FallbackOptions {
    /// Collections need strictly more products than this to be listed.
    pub min_products: u64,
    pub limit: usize,
}

impl Default for FallbackOptions {
    fn default() -> Self {
        Self {
            min_products: 5,
            limit: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "source", content = "path", rename_all = "snake_case")]
pub enum FallbackSource {
    Local(String),
    Remote(String),
    None,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CoverFallback {
    pub handle: String,
    pub title: String,
    pub products_count: u64,
    pub suggestion: FallbackSource,
}

pub fn run_fallbacks(
    paths: &ResolvedPaths,
    config: &CatalogToolConfig,
    options: &FallbackOptions,
) -> Result<Vec<CoverFallback>> {
    let catalog = Catalog::load(&paths.data_dir, &config.catalog.files)?;
    let product_images = LocalFileIndex::scan(&paths.products_dir(&config.assets))?;
    Ok(find_cover_fallbacks(
        &catalog,
        &product_images,
        &config.assets,
        options,
    ))
}

/// Collections without a cover, largest first, each paired with the first
/// image found among its member products.
pub fn find_cover_fallbacks(
    catalog: &Catalog,
    product_images: &LocalFileIndex,
    assets: &AssetsSection,
    options: &FallbackOptions,
) -> Vec<CoverFallback> {
    let products: HashMap<&str, &Value> = catalog
        .records(EntityKind::Product)
        .filter_map(|record| record_handle(record).map(|handle| (handle, record)))
        .collect();

    let mut uncovered: Vec<(&Value, u64)> = catalog
        .records(EntityKind::Collection)
        .filter(|collection| cover_src(collection).is_none())
        .map(|collection| (collection, products_count(collection)))
        .filter(|(_, count)| *count > options.min_products)
        .collect();
    uncovered.sort_by(|left, right| right.1.cmp(&left.1));
    uncovered.truncate(options.limit);

    uncovered
        .into_iter()
        .map(|(collection, count)| {
            let handle = record_handle(collection).unwrap_or_default();
            CoverFallback {
                handle: handle.to_string(),
                title: record_title(collection).unwrap_or(handle).to_string(),
                products_count: count,
                suggestion: suggest(collection, &products, product_images, assets),
            }
        })
        .collect()
}

fn suggest(
    collection: &Value,
    products: &HashMap<&str, &Value>,
    product_images: &LocalFileIndex,
    assets: &AssetsSection,
) -> FallbackSource {
    let first = member_handles(collection).find_map(|member| {
        let product = products.get(member)?;
        let src = product
            .get("images")?
            .get(0)?
            .get("src")?
            .as_str()
            .filter(|src| !src.is_empty())?;
        Some((member, src))
    });
    let Some((member, src)) = first else {
        return FallbackSource::None;
    };

    if !assets.is_remote(src) {
        return FallbackSource::Local(src.to_string());
    }
    let prefix = assets.products_url_prefix.trim_end_matches('/');
    let mirrored = product_images
        .find(&file_stem(member, AssetSlot::Product(0)), &assets.extensions)
        .or_else(|| remote_basename(src).filter(|name| product_images.contains(name)));
    match mirrored {
        Some(name) => FallbackSource::Local(format!("{prefix}/{name}")),
        None => FallbackSource::Remote(src.to_string()),
    }
}

fn cover_src(collection: &Value) -> Option<&str> {
    collection
        .get("image")
        .and_then(|image| image.get("src"))
        .and_then(Value::as_str)
        .filter(|src| !src.is_empty())
}

/// `products_count` when present, otherwise the number of listed member handles.
fn products_count(collection: &Value) -> u64 {
    collection
        .get("products_count")
        .and_then(Value::as_u64)
        .unwrap_or_else(|| member_handles(collection).count() as u64)
}

fn member_handles(collection: &Value) -> impl Iterator<Item = &str> {
    collection
        .get("product_handles")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(Value::as_str)
}

fn remote_basename(url: &str) -> Option<String> {
    let path = url.split(['?', '#']).next()?;
    path.rsplit('/')
        .next()
        .filter(|name| !name.is_empty())
        .map(ToString::to_string)
}
