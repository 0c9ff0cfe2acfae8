use std::collections::HashSet;

use serde_json::Value;

use crate::catalog::{Catalog, EntityKind, record_handle};

/// Known-good handles per entity kind, built once per run and never mutated afterwards.
#[derive(Debug, Clone, Default)]
pub struct CatalogIndex {
    products: HashSet<String>,
    collections: HashSet<String>,
    pages: HashSet<String>,
}

impl CatalogIndex {
    /// Records without a non-blank `handle` are skipped.
    pub fn build<'a, P, C, G>(products: P, collections: C, pages: G) -> Self
    where
        P: IntoIterator<Item = &'a Value>,
        C: IntoIterator<Item = &'a Value>,
        G: IntoIterator<Item = &'a Value>,
    {
        Self {
            products: collect_handles(products),
            collections: collect_handles(collections),
            pages: collect_handles(pages),
        }
    }

    /// Index a loaded catalog. `extra_collections` are listing handles that exist
    /// on the site without a catalog record (e.g. `shop`).
    pub fn from_catalog(catalog: &Catalog, extra_collections: &[String]) -> Self {
        let mut index = Self::build(
            catalog.records(EntityKind::Product),
            catalog.records(EntityKind::Collection),
            catalog.records(EntityKind::Page),
        );
        index.collections.extend(
            extra_collections
                .iter()
                .filter(|handle| !handle.trim().is_empty())
                .cloned(),
        );
        index
    }

    pub fn is_product(&self, handle: &str) -> bool {
        self.products.contains(handle)
    }

    pub fn is_collection(&self, handle: &str) -> bool {
        self.collections.contains(handle)
    }

    /// Page membership is reported (`page_count`) but no link rule keys on it:
    /// `/pages/...` paths are only touched by the configured exact renames.
    pub fn is_page(&self, handle: &str) -> bool {
        self.pages.contains(handle)
    }

    pub fn collections(&self) -> impl Iterator<Item = &str> {
        self.collections.iter().map(String::as_str)
    }

    pub fn product_count(&self) -> usize {
        self.products.len()
    }

    pub fn collection_count(&self) -> usize {
        self.collections.len()
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }
}

fn collect_handles<'a, I>(records: I) -> HashSet<String>
where
    I: IntoIterator<Item = &'a Value>,
{
    records
        .into_iter()
        .filter_map(record_handle)
        .map(ToString::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn build_partitions_handles_by_kind() {
        let products = [json!({"handle": "ghost-pod"}), json!({"handle": "blue-mod"})];
        let collections = [json!({"handle": "e-juices"})];
        let pages = [json!({"handle": "about"})];

        let index = CatalogIndex::build(&products, &collections, &pages);
        assert!(index.is_product("ghost-pod"));
        assert!(index.is_collection("e-juices"));
        assert!(index.is_page("about"));
        assert!(!index.is_collection("ghost-pod"));
        assert!(!index.is_product("about"));
        assert_eq!(index.product_count(), 2);
    }

    #[test]
    fn blank_and_missing_handles_are_never_indexed() {
        let products = [
            json!({"handle": ""}),
            json!({"handle": "   "}),
            json!({"title": "No handle"}),
            json!({"handle": null}),
            json!("not an object"),
        ];
        let none: [Value; 0] = [];
        let index = CatalogIndex::build(&products, &none, &none);
        assert_eq!(index.product_count(), 0);
        assert!(!index.is_product(""));
        assert!(!index.is_product("   "));
    }

    #[test]
    fn from_catalog_adds_extra_collections() {
        let catalog = Catalog::default();
        let index = CatalogIndex::from_catalog(&catalog, &["shop".to_string(), " ".to_string()]);
        assert!(index.is_collection("shop"));
        assert_eq!(index.collection_count(), 1);
    }
}
