use std::collections::{BTreeMap, HashMap};

use tracing::debug;

use crate::config::RedirectTarget;
use crate::index::CatalogIndex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedTarget {
    /// The handle is a live collection.
    SameAsValid,
    /// The handle was renamed or merged into another live collection.
    Redirect(String),
    /// No catalog equivalent; send the reader to the collections index.
    GenericListing,
}

/// Immutable legacy-collection lookup table.
///
/// Explicit entries are seeded first, then every live collection is back-filled
/// as an identity entry. Redirect targets are checked against the index so a
/// rewritten link never lands on another unknown handle.
#[derive(Debug, Clone, Default)]
pub struct RedirectResolver {
    table: HashMap<String, ResolvedTarget>,
}

impl RedirectResolver {
    pub fn build(
        index: &CatalogIndex,
        entries: &BTreeMap<String, RedirectTarget>,
        vendor_handle: Option<&str>,
    ) -> Self {
        let mut table = HashMap::with_capacity(entries.len() + index.collection_count());

        for (legacy, target) in entries {
            let legacy = legacy.trim();
            if legacy.is_empty() {
                continue;
            }
            let resolved = match target {
                RedirectTarget::Single(handle) => live_target(index, legacy, [handle.as_str()]),
                RedirectTarget::Candidates(handles) => {
                    live_target(index, legacy, handles.iter().map(String::as_str))
                }
            };
            table.insert(legacy.to_string(), resolved);
        }

        if let Some(vendor) = vendor_handle.map(str::trim).filter(|value| !value.is_empty()) {
            table.insert(vendor.to_string(), ResolvedTarget::GenericListing);
        }

        for handle in index.collections() {
            table
                .entry(handle.to_string())
                .or_insert(ResolvedTarget::SameAsValid);
        }

        Self { table }
    }

    /// Total over all strings: unknown handles resolve to the generic listing.
    pub fn resolve(&self, handle: &str) -> ResolvedTarget {
        self.table
            .get(handle)
            .cloned()
            .unwrap_or(ResolvedTarget::GenericListing)
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

fn live_target<'a, I>(index: &CatalogIndex, legacy: &str, candidates: I) -> ResolvedTarget
where
    I: IntoIterator<Item = &'a str>,
{
    let mut any = false;
    for candidate in candidates {
        let candidate = candidate.trim();
        if candidate.is_empty() {
            continue;
        }
        any = true;
        if index.is_collection(candidate) {
            return ResolvedTarget::Redirect(candidate.to_string());
        }
    }
    if any {
        debug!(legacy, "redirect target is not a live collection; using generic listing");
    }
    ResolvedTarget::GenericListing
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn index() -> CatalogIndex {
        let collections = [
            json!({"handle": "usa-premium-e-juices"}),
            json!({"handle": "all-accessories"}),
            json!({"handle": "shop"}),
            json!({"handle": "tanks"}),
        ];
        let none: [serde_json::Value; 0] = [];
        CatalogIndex::build(&none, &collections, &none)
    }

    fn entries() -> BTreeMap<String, RedirectTarget> {
        BTreeMap::from([
            (
                "vapetasia".to_string(),
                RedirectTarget::Single("usa-premium-e-juices".to_string()),
            ),
            (
                "coils".to_string(),
                RedirectTarget::Single("all-accessories".to_string()),
            ),
            (
                "tanks".to_string(),
                RedirectTarget::Single("all-accessories".to_string()),
            ),
            ("vendors".to_string(), RedirectTarget::Single("shop".to_string())),
            (
                "disposable-vapes".to_string(),
                RedirectTarget::Candidates(vec!["disposable-vapes-1".to_string(), "shop".to_string()]),
            ),
            (
                "e-liquids".to_string(),
                RedirectTarget::Single("e-juices".to_string()),
            ),
            ("brands".to_string(), RedirectTarget::Single(String::new())),
        ])
    }

    #[test]
    fn explicit_entries_redirect_to_live_collections() {
        let resolver = RedirectResolver::build(&index(), &entries(), Some("vendors"));
        assert_eq!(
            resolver.resolve("vapetasia"),
            ResolvedTarget::Redirect("usa-premium-e-juices".to_string())
        );
        assert_eq!(
            resolver.resolve("coils"),
            ResolvedTarget::Redirect("all-accessories".to_string())
        );
    }

    #[test]
    fn candidate_lists_pick_the_first_live_handle() {
        let resolver = RedirectResolver::build(&index(), &entries(), Some("vendors"));
        assert_eq!(
            resolver.resolve("disposable-vapes"),
            ResolvedTarget::Redirect("shop".to_string())
        );
    }

    #[test]
    fn dead_targets_and_empty_targets_fall_back_to_generic_listing() {
        let resolver = RedirectResolver::build(&index(), &entries(), Some("vendors"));
        assert_eq!(resolver.resolve("e-liquids"), ResolvedTarget::GenericListing);
        assert_eq!(resolver.resolve("brands"), ResolvedTarget::GenericListing);
    }

    #[test]
    fn vendors_always_resolve_to_generic_listing() {
        let resolver = RedirectResolver::build(&index(), &entries(), Some("vendors"));
        assert_eq!(resolver.resolve("vendors"), ResolvedTarget::GenericListing);
    }

    #[test]
    fn live_collections_back_fill_as_identity() {
        let resolver = RedirectResolver::build(&index(), &entries(), Some("vendors"));
        assert_eq!(resolver.resolve("shop"), ResolvedTarget::SameAsValid);
        assert_eq!(
            resolver.resolve("usa-premium-e-juices"),
            ResolvedTarget::SameAsValid
        );
        // explicit entries win over the back-fill, as with a setdefault seed
        assert_eq!(
            resolver.resolve("tanks"),
            ResolvedTarget::Redirect("all-accessories".to_string())
        );
    }

    #[test]
    fn resolution_is_total() {
        let resolver = RedirectResolver::build(&index(), &entries(), Some("vendors"));
        for handle in ["", " ", "unknown", "../etc", "ÜBER", "vapetasia?x=1"] {
            assert!(matches!(
                resolver.resolve(handle),
                ResolvedTarget::SameAsValid | ResolvedTarget::Redirect(_) | ResolvedTarget::GenericListing
            ));
        }
        assert_eq!(resolver.resolve("unknown"), ResolvedTarget::GenericListing);
        assert!(!resolver.is_empty());
    }
}
