//! Local mirroring of remote catalog images.
//!
//! Mirror files are named deterministically: `<handle>_<index>.<ext>` for
//! product images and `<handle>.<ext>` for collection covers. An existing file
//! with the expected name is authoritative and is never downloaded over.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

use anyhow::{Context, Result, bail};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::catalog::write_atomic;
use crate::config::AssetsSection;
use crate::external::{AssetFetcher, RetryPolicy, with_retries};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AssetSlot {
    /// Position in a product's image list.
    Product(usize),
    /// The single cover image of a collection.
    CollectionCover,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Not hosted on the CDN; nothing to do.
    AlreadyLocal,
    /// The reference now points at a local mirror.
    Localized { path: String, downloaded: bool },
    /// Every download attempt failed; the reference is unchanged.
    Failed(String),
    /// No mirror exists and downloading is disabled; the reference is unchanged.
    Missing,
}

/// File stem shared by every accepted extension for one `(handle, slot)`.
pub fn file_stem(handle: &str, slot: AssetSlot) -> String {
    match slot {
        AssetSlot::Product(index) => format!("{handle}_{index}"),
        AssetSlot::CollectionCover => handle.to_string(),
    }
}

/// Extension of the remote file, ignoring query strings; `fallback` when unknown.
pub fn extension_from_url(url: &str, accepted: &[String], fallback: &str) -> String {
    let clean = url.split(['?', '#']).next().unwrap_or(url);
    let last_segment = clean.rsplit('/').next().unwrap_or(clean);
    last_segment
        .rsplit_once('.')
        .map(|(_, extension)| extension.to_ascii_lowercase())
        .filter(|extension| accepted.iter().any(|known| known == extension))
        .unwrap_or_else(|| fallback.to_string())
}

/// Known file names in one asset directory, shared by download workers.
///
/// `in_flight` holds stems currently being downloaded; a second worker for the
/// same stem waits on `released` and then re-checks `files`.
#[derive(Debug)]
pub struct LocalFileIndex {
    dir: PathBuf,
    state: Mutex<IndexState>,
    released: Condvar,
}

#[derive(Debug, Default)]
struct IndexState {
    files: HashSet<String>,
    in_flight: HashSet<String>,
}

enum Claim<'a> {
    Found(String),
    Owned(ClaimGuard<'a>),
}

/// Releases an in-flight stem on drop, successful or not.
struct ClaimGuard<'a> {
    index: &'a LocalFileIndex,
    stem: String,
}

impl ClaimGuard<'_> {
    fn complete(self, file_name: String) {
        self.index.lock().files.insert(file_name);
    }
}

impl Drop for ClaimGuard<'_> {
    fn drop(&mut self) {
        self.index.lock().in_flight.remove(&self.stem);
        self.index.released.notify_all();
    }
}

impl LocalFileIndex {
    /// List regular files directly inside `dir`. A missing directory is an empty index.
    pub fn scan(dir: &Path) -> Result<Self> {
        let mut files = HashSet::new();
        if dir.exists() {
            for entry in WalkDir::new(dir).min_depth(1).max_depth(1) {
                let entry = entry.with_context(|| format!("failed to list {}", dir.display()))?;
                if entry.file_type().is_file() {
                    files.insert(entry.file_name().to_string_lossy().to_string());
                }
            }
        }
        Ok(Self::from_names(dir, files))
    }

    pub fn from_names<I, S>(dir: &Path, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            dir: dir.to_path_buf(),
            state: Mutex::new(IndexState {
                files: names.into_iter().map(Into::into).collect(),
                in_flight: HashSet::new(),
            }),
            released: Condvar::new(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn contains(&self, file_name: &str) -> bool {
        self.lock().files.contains(file_name)
    }

    pub fn len(&self) -> usize {
        self.lock().files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().files.is_empty()
    }

    /// First `<stem>.<ext>` present, trying extensions in order.
    pub fn find(&self, stem: &str, extensions: &[String]) -> Option<String> {
        find_in(&self.lock().files, stem, extensions)
    }

    fn claim(&self, stem: &str, extensions: &[String]) -> Claim<'_> {
        let mut state = self.lock();
        loop {
            if let Some(name) = find_in(&state.files, stem, extensions) {
                return Claim::Found(name);
            }
            if !state.in_flight.contains(stem) {
                state.in_flight.insert(stem.to_string());
                return Claim::Owned(ClaimGuard {
                    index: self,
                    stem: stem.to_string(),
                });
            }
            state = self
                .released
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn lock(&self) -> MutexGuard<'_, IndexState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn find_in(files: &HashSet<String>, stem: &str, extensions: &[String]) -> Option<String> {
    extensions
        .iter()
        .map(|extension| format!("{stem}.{extension}"))
        .find(|name| files.contains(name))
}

/// Maps CDN references to local mirror paths, downloading missing mirrors.
pub struct AssetLocalizer<'a> {
    assets: &'a AssetsSection,
    products: &'a LocalFileIndex,
    collections: &'a LocalFileIndex,
    fetcher: Option<&'a dyn AssetFetcher>,
    retry: RetryPolicy,
}

impl<'a> AssetLocalizer<'a> {
    /// `fetcher: None` disables the network; missing mirrors yield [`Outcome::Missing`].
    pub fn new(
        assets: &'a AssetsSection,
        products: &'a LocalFileIndex,
        collections: &'a LocalFileIndex,
        fetcher: Option<&'a dyn AssetFetcher>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            assets,
            products,
            collections,
            fetcher,
            retry,
        }
    }

    pub fn is_remote(&self, reference: &str) -> bool {
        self.assets.is_remote(reference)
    }

    pub fn localize(&self, reference: &str, handle: &str, slot: AssetSlot) -> Outcome {
        if !self.is_remote(reference) {
            return Outcome::AlreadyLocal;
        }
        if let Err(error) = check_handle(handle) {
            return Outcome::Failed(error.to_string());
        }

        let (index, url_prefix) = match slot {
            AssetSlot::Product(_) => (self.products, self.assets.products_url_prefix.as_str()),
            AssetSlot::CollectionCover => {
                (self.collections, self.assets.collections_url_prefix.as_str())
            }
        };
        let stem = file_stem(handle, slot);

        let Some(fetcher) = self.fetcher else {
            return match index.find(&stem, &self.assets.extensions) {
                Some(name) => localized(url_prefix, &name, false),
                None => Outcome::Missing,
            };
        };

        let guard = match index.claim(&stem, &self.assets.extensions) {
            Claim::Found(name) => return localized(url_prefix, &name, false),
            Claim::Owned(guard) => guard,
        };

        let extension =
            extension_from_url(reference, &self.assets.extensions, &self.assets.fallback_extension);
        let file_name = format!("{stem}.{extension}");
        let destination = index.dir().join(&file_name);
        debug!(url = reference, destination = %destination.display(), "downloading asset");

        let result = with_retries(&self.retry, reference, |_| {
            let bytes = fetcher.fetch(reference)?;
            write_atomic(&destination, &bytes)
        });
        match result {
            Ok(()) => {
                guard.complete(file_name.clone());
                localized(url_prefix, &file_name, true)
            }
            Err(error) => {
                warn!(url = reference, handle, error = %error, "asset download failed");
                Outcome::Failed(format!("{error:#}"))
            }
        }
    }
}

fn localized(url_prefix: &str, file_name: &str, downloaded: bool) -> Outcome {
    Outcome::Localized {
        path: format!("{}/{}", url_prefix.trim_end_matches('/'), file_name),
        downloaded,
    }
}

/// Handles become file names; reject anything that could leave the asset directory.
fn check_handle(handle: &str) -> Result<()> {
    if handle.trim().is_empty() {
        bail!("record has no handle");
    }
    if handle.contains(['/', '\\']) || handle.starts_with('.') || handle.contains("..") {
        bail!("unsafe handle for asset file name: {handle}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_config;
    use std::fs;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Barrier};
    use std::thread;
    use std::time::Duration;
    use tempfile::tempdir;

    struct ScriptedFetcher {
        calls: AtomicUsize,
        fail: bool,
        delay: Duration,
    }

    impl ScriptedFetcher {
        fn ok() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail: false,
                delay: Duration::ZERO,
            }
        }

        fn failing() -> Self {
            Self {
                fail: true,
                ..Self::ok()
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl AssetFetcher for ScriptedFetcher {
        fn fetch(&self, url: &str) -> Result<Vec<u8>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            thread::sleep(self.delay);
            if self.fail {
                bail!("connection refused: {url}");
            }
            Ok(b"\x89PNG".to_vec())
        }
    }

    fn retry() -> RetryPolicy {
        RetryPolicy {
            attempts: 3,
            retry_delay_ms: 0,
        }
    }

    const REMOTE: &str = "https://cdn.shopify.com/s/files/1/0001/products/Blue.PNG?v=1699";

    #[test]
    fn extension_is_taken_from_url_path() {
        let config = parse_config(None).expect("config");
        let accepted = &config.assets.extensions;
        assert_eq!(extension_from_url(REMOTE, accepted, "jpg"), "png");
        assert_eq!(
            extension_from_url("https://cdn.shopify.com/a/b.avif?x=1.png", accepted, "jpg"),
            "jpg"
        );
        assert_eq!(
            extension_from_url("https://cdn.shopify.com/a/noext", accepted, "jpg"),
            "jpg"
        );
        assert_eq!(
            extension_from_url("https://cdn.shopify.com.au/dir.v2/file", accepted, "jpg"),
            "jpg"
        );
    }

    #[test]
    fn stems_follow_naming_convention() {
        assert_eq!(file_stem("blue-mod", AssetSlot::Product(2)), "blue-mod_2");
        assert_eq!(file_stem("e-juices", AssetSlot::CollectionCover), "e-juices");
    }

    #[test]
    fn non_cdn_references_are_already_local() {
        let config = parse_config(None).expect("config");
        let products = LocalFileIndex::from_names(Path::new("/nowhere"), Vec::<String>::new());
        let collections = LocalFileIndex::from_names(Path::new("/nowhere"), Vec::<String>::new());
        let fetcher = ScriptedFetcher::ok();
        let localizer =
            AssetLocalizer::new(&config.assets, &products, &collections, Some(&fetcher), retry());
        assert_eq!(
            localizer.localize("/images/products/blue-mod_0.jpg", "blue-mod", AssetSlot::Product(0)),
            Outcome::AlreadyLocal
        );
        assert_eq!(fetcher.calls(), 0);
    }

    #[test]
    fn existing_mirror_is_used_without_network() {
        let config = parse_config(None).expect("config");
        let products =
            LocalFileIndex::from_names(Path::new("/nowhere"), ["blue-mod_2.png", "blue-mod_1.jpg"]);
        let collections = LocalFileIndex::from_names(Path::new("/nowhere"), ["e-juices.webp"]);
        let fetcher = ScriptedFetcher::ok();
        let localizer =
            AssetLocalizer::new(&config.assets, &products, &collections, Some(&fetcher), retry());

        assert_eq!(
            localizer.localize(REMOTE, "blue-mod", AssetSlot::Product(2)),
            Outcome::Localized {
                path: "/images/products/blue-mod_2.png".to_string(),
                downloaded: false
            }
        );
        assert_eq!(
            localizer.localize(REMOTE, "e-juices", AssetSlot::CollectionCover),
            Outcome::Localized {
                path: "/images/collections/e-juices.webp".to_string(),
                downloaded: false
            }
        );
        assert_eq!(fetcher.calls(), 0);
    }

    #[test]
    fn missing_mirror_is_downloaded_once_and_recorded() {
        let temp = tempdir().expect("tempdir");
        let config = parse_config(None).expect("config");
        let products_dir = temp.path().join("products");
        let products = LocalFileIndex::scan(&products_dir).expect("scan");
        let collections = LocalFileIndex::scan(&temp.path().join("collections")).expect("scan");
        let fetcher = ScriptedFetcher::ok();
        let localizer =
            AssetLocalizer::new(&config.assets, &products, &collections, Some(&fetcher), retry());

        let outcome = localizer.localize(REMOTE, "blue-mod", AssetSlot::Product(0));
        assert_eq!(
            outcome,
            Outcome::Localized {
                path: "/images/products/blue-mod_0.png".to_string(),
                downloaded: true
            }
        );
        assert!(products_dir.join("blue-mod_0.png").exists());
        assert!(products.contains("blue-mod_0.png"));

        let again = localizer.localize(REMOTE, "blue-mod", AssetSlot::Product(0));
        assert_eq!(
            again,
            Outcome::Localized {
                path: "/images/products/blue-mod_0.png".to_string(),
                downloaded: false
            }
        );
        assert_eq!(fetcher.calls(), 1);
    }

    #[test]
    fn failing_fetch_is_attempted_exactly_the_configured_times() {
        let temp = tempdir().expect("tempdir");
        let config = parse_config(None).expect("config");
        let products = LocalFileIndex::scan(&temp.path().join("products")).expect("scan");
        let collections = LocalFileIndex::scan(&temp.path().join("collections")).expect("scan");
        let fetcher = ScriptedFetcher::failing();
        let localizer =
            AssetLocalizer::new(&config.assets, &products, &collections, Some(&fetcher), retry());

        let outcome = localizer.localize(REMOTE, "ghost-pod", AssetSlot::Product(1));
        assert!(matches!(outcome, Outcome::Failed(ref reason) if reason.contains("connection refused")));
        assert_eq!(fetcher.calls(), 3);
        assert!(products.is_empty());
        assert!(!temp.path().join("products").join("ghost-pod_1.png").exists());

        // the claim was released, so a later call tries again
        let _ = localizer.localize(REMOTE, "ghost-pod", AssetSlot::Product(1));
        assert_eq!(fetcher.calls(), 6);
    }

    #[test]
    fn offline_mode_reports_missing() {
        let config = parse_config(None).expect("config");
        let products = LocalFileIndex::from_names(Path::new("/nowhere"), ["a_0.jpg"]);
        let collections = LocalFileIndex::from_names(Path::new("/nowhere"), Vec::<String>::new());
        let localizer = AssetLocalizer::new(&config.assets, &products, &collections, None, retry());
        assert_eq!(
            localizer.localize(REMOTE, "b", AssetSlot::Product(0)),
            Outcome::Missing
        );
        assert!(matches!(
            localizer.localize(REMOTE, "a", AssetSlot::Product(0)),
            Outcome::Localized { downloaded: false, .. }
        ));
    }

    #[test]
    fn unsafe_handles_are_refused() {
        let config = parse_config(None).expect("config");
        let products = LocalFileIndex::from_names(Path::new("/nowhere"), Vec::<String>::new());
        let collections = LocalFileIndex::from_names(Path::new("/nowhere"), Vec::<String>::new());
        let fetcher = ScriptedFetcher::ok();
        let localizer =
            AssetLocalizer::new(&config.assets, &products, &collections, Some(&fetcher), retry());
        for handle in ["../escape", "a/b", "", ".hidden"] {
            assert!(matches!(
                localizer.localize(REMOTE, handle, AssetSlot::Product(0)),
                Outcome::Failed(_)
            ));
        }
        assert_eq!(fetcher.calls(), 0);
    }

    #[test]
    fn concurrent_requests_for_one_asset_download_once() {
        let temp = tempdir().expect("tempdir");
        let config = parse_config(None).expect("config");
        let products = LocalFileIndex::scan(&temp.path().join("products")).expect("scan");
        let collections = LocalFileIndex::scan(&temp.path().join("collections")).expect("scan");
        let fetcher = ScriptedFetcher {
            delay: Duration::from_millis(50),
            ..ScriptedFetcher::ok()
        };
        let localizer =
            AssetLocalizer::new(&config.assets, &products, &collections, Some(&fetcher), retry());
        let barrier = Arc::new(Barrier::new(4));

        let outcomes = thread::scope(|scope| {
            let handles = (0..4)
                .map(|_| {
                    let barrier = Arc::clone(&barrier);
                    let localizer = &localizer;
                    scope.spawn(move || {
                        barrier.wait();
                        localizer.localize(REMOTE, "blue-mod", AssetSlot::Product(0))
                    })
                })
                .collect::<Vec<_>>();
            handles
                .into_iter()
                .map(|handle| handle.join().expect("join"))
                .collect::<Vec<_>>()
        });

        assert_eq!(fetcher.calls(), 1);
        let downloaded = outcomes
            .iter()
            .filter(|outcome| matches!(outcome, Outcome::Localized { downloaded: true, .. }))
            .count();
        assert_eq!(downloaded, 1);
        assert!(outcomes.iter().all(|outcome| matches!(
            outcome,
            Outcome::Localized { path, .. } if path == "/images/products/blue-mod_0.png"
        )));
    }

    #[test]
    fn scan_lists_only_files() {
        let temp = tempdir().expect("tempdir");
        fs::create_dir_all(temp.path().join("sub")).expect("mkdir");
        fs::write(temp.path().join("a_0.jpg"), b"x").expect("write");
        fs::write(temp.path().join("sub").join("b_0.jpg"), b"x").expect("write");
        let index = LocalFileIndex::scan(temp.path()).expect("scan");
        assert_eq!(index.len(), 1);
        assert!(index.contains("a_0.jpg"));
        assert_eq!(
            index.find("a_0", &["png".to_string(), "jpg".to_string()]),
            Some("a_0.jpg".to_string())
        );
    }
}
