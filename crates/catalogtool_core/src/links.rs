//! Hyperlink repair for HTML-bearing catalog fields.
//!
//! Attribute values are located with a tolerant pattern instead of an HTML
//! parser: historical content is not guaranteed to be well-formed, and a strict
//! parser would drop fragments the storefront still renders. Each `href` value
//! runs through a fixed cascade; the first rule that produces a target wins.

use std::borrow::Cow;
use std::collections::HashMap;

use anyhow::{Context, Result};
use regex::{Captures, Regex};
use tracing::debug;

use crate::config::CatalogToolConfig;
use crate::index::CatalogIndex;
use crate::redirects::{RedirectResolver, ResolvedTarget};

/// Compiled, immutable link rules derived from configuration.
#[derive(Debug, Clone)]
pub struct LinkRules {
    domains: Vec<String>,
    shop_path: String,
    collections_index: String,
    vendor_prefix: String,
    page_renames: HashMap<String, String>,
    href: Regex,
    nested_product: Regex,
    collection: Regex,
    product: Regex,
}

impl LinkRules {
    pub fn from_config(config: &CatalogToolConfig) -> Result<Self> {
        let domains = config
            .site
            .domains
            .iter()
            .map(|domain| domain.trim().to_ascii_lowercase())
            .map(|domain| domain.strip_prefix("www.").map(str::to_string).unwrap_or(domain))
            .filter(|domain| !domain.is_empty())
            .collect();
        let page_renames = config
            .redirects
            .pages
            .iter()
            .map(|rename| (rename.from.clone(), rename.to.clone()))
            .collect();

        Ok(Self {
            domains,
            shop_path: config.site.shop_path.clone(),
            collections_index: config.site.collections_index.clone(),
            vendor_prefix: config.redirects.vendor_prefix.trim().to_string(),
            page_renames,
            href: compile(r#"(?i)(\bhref\s*=\s*["'])([^"']*)(["'])"#)?,
            nested_product: compile(r"^/collections/[^/]+/products/([^/]+)")?,
            collection: compile(r"^/collections/([^/]+)$")?,
            product: compile(r"^/products/([^/]+)$")?,
        })
    }

    /// Last segment of the vendor prefix (`vendors` for `/collections/vendors`).
    pub fn vendor_handle(&self) -> Option<&str> {
        self.vendor_prefix
            .rsplit('/')
            .next()
            .filter(|segment| !segment.is_empty())
    }

    /// Remainder after scheme and host when `url` is on one of the site's own domains.
    pub fn strip_own_domain<'u>(&self, url: &'u str) -> Option<&'u str> {
        let rest = strip_prefix_ignore_case(url, "https://")
            .or_else(|| strip_prefix_ignore_case(url, "http://"))
            .or_else(|| url.strip_prefix("//"))?;
        let host_end = rest.find(['/', '?', '#']).unwrap_or(rest.len());
        let host = rest[..host_end].to_ascii_lowercase();
        let host = host.strip_prefix("www.").unwrap_or(&host);
        if self.domains.iter().any(|domain| domain == host) {
            Some(&rest[host_end..])
        } else {
            None
        }
    }

    /// `/collections/vendors` itself or anything below it, not `/collections/vendors-choice`.
    fn is_vendor_path(&self, path: &str) -> bool {
        let prefix = self.vendor_prefix.trim_end_matches('/');
        !prefix.is_empty()
            && path
                .strip_prefix(prefix)
                .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
    }

    pub fn is_own_domain(&self, url: &str) -> bool {
        self.strip_own_domain(url).is_some()
    }

    /// Raw (still entity-encoded) `href` values in document order.
    pub fn hrefs<'h>(&self, html: &'h str) -> impl Iterator<Item = &'h str> {
        self.href
            .captures_iter(html)
            .filter_map(|captures| captures.get(2))
            .map(|value| value.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FragmentRewrite<'t> {
    pub html: Cow<'t, str>,
    pub changes: usize,
}

/// Rewrites links against the run's validity index and redirect table.
#[derive(Debug, Clone, Copy)]
pub struct LinkRewriter<'a> {
    rules: &'a LinkRules,
    index: &'a CatalogIndex,
    redirects: &'a RedirectResolver,
}

impl<'a> LinkRewriter<'a> {
    pub fn new(rules: &'a LinkRules, index: &'a CatalogIndex, redirects: &'a RedirectResolver) -> Self {
        Self {
            rules,
            index,
            redirects,
        }
    }

    /// Rewrite every `href` in `html`. Only values that actually change are counted.
    pub fn rewrite<'t>(&self, html: &'t str) -> FragmentRewrite<'t> {
        let mut changes = 0usize;
        let rewritten = self.rules.href.replace_all(html, |captures: &Captures<'_>| {
            match self.rewrite_href(&captures[2]) {
                Some(target) => {
                    debug!(from = &captures[2], to = %target, "rewrote link");
                    changes += 1;
                    format!("{}{}{}", &captures[1], target, &captures[3])
                }
                None => captures[0].to_string(),
            }
        });
        if changes == 0 {
            return FragmentRewrite {
                html: Cow::Borrowed(html),
                changes,
            };
        }
        FragmentRewrite {
            html: rewritten,
            changes,
        }
    }

    /// New value for a single `href`, or `None` when it stays as written.
    /// The result is entity-encoded and ready to go back inside a quoted attribute.
    pub fn rewrite_href(&self, original: &str) -> Option<String> {
        let decoded = html_escape::decode_html_entities(original);
        let (path, own_domain): (Cow<'_, str>, bool) = match self.rules.strip_own_domain(&decoded) {
            Some("") => (Cow::Borrowed("/"), true),
            Some(rest) if rest.starts_with('/') => (Cow::Borrowed(rest), true),
            Some(rest) => (Cow::Owned(format!("/{rest}")), true),
            None if decoded.starts_with('/') && !decoded.starts_with("//") => {
                (Cow::Borrowed(decoded.as_ref()), false)
            }
            None => return None,
        };

        let target = match self.apply_rules(match_key(&path)) {
            RuleOutcome::Rewrite(target) => target,
            RuleOutcome::Keep | RuleOutcome::NoMatch if own_domain => without_query(&path),
            RuleOutcome::Keep | RuleOutcome::NoMatch => return None,
        };
        Some(html_escape::encode_quoted_attribute(&target).into_owned())
            .filter(|target| target != original)
    }

    fn apply_rules(&self, path: &str) -> RuleOutcome {
        let rules = self.rules;

        if let Some(captures) = rules.nested_product.captures(path) {
            let handle = &captures[1];
            if self.index.is_product(handle) {
                return RuleOutcome::Rewrite(format!("/products/{handle}"));
            }
            return RuleOutcome::Rewrite(rules.shop_path.clone());
        }

        if let Some(captures) = rules.collection.captures(path) {
            let handle = &captures[1];
            if self.index.is_collection(handle) {
                return RuleOutcome::Keep;
            }
            return match self.redirects.resolve(handle) {
                ResolvedTarget::Redirect(target) => RuleOutcome::Rewrite(format!("/collections/{target}")),
                ResolvedTarget::GenericListing => RuleOutcome::Rewrite(rules.collections_index.clone()),
                ResolvedTarget::SameAsValid => RuleOutcome::Keep,
            };
        }

        if let Some(captures) = rules.product.captures(path) {
            if self.index.is_product(&captures[1]) {
                return RuleOutcome::Keep;
            }
            return RuleOutcome::Rewrite(rules.shop_path.clone());
        }

        if let Some(target) = rules.page_renames.get(path) {
            return RuleOutcome::Rewrite(target.clone());
        }

        if rules.is_vendor_path(path) {
            return RuleOutcome::Rewrite(rules.collections_index.clone());
        }

        RuleOutcome::NoMatch
    }
}

/// Result of the rule cascade for one path. `Keep` stops the cascade.
#[derive(Debug, Clone, PartialEq, Eq)]
enum RuleOutcome {
    Rewrite(String),
    Keep,
    NoMatch,
}

fn compile(pattern: &str) -> Result<Regex> {
    Regex::new(pattern).with_context(|| format!("invalid link pattern {pattern}"))
}

fn strip_prefix_ignore_case<'v>(value: &'v str, prefix: &str) -> Option<&'v str> {
    let head = value.get(..prefix.len())?;
    if head.eq_ignore_ascii_case(prefix) {
        Some(&value[prefix.len()..])
    } else {
        None
    }
}

/// Path portion used for rule matching: no query string, no fragment.
fn match_key(path: &str) -> &str {
    let end = path.find(['?', '#']).unwrap_or(path.len());
    &path[..end]
}

/// Drop the query string but keep any fragment.
fn without_query(path: &str) -> String {
    let (base, fragment) = match path.split_once('#') {
        Some((base, fragment)) => (base, Some(fragment)),
        None => (path, None),
    };
    let base = match_key(base);
    match fragment {
        Some(fragment) => format!("{base}#{fragment}"),
        None => base.to_string(),
    }
}
