//! Environment Bank
//!
//! Keyed store of built environments with staleness re-validation and
//! opportunistic eviction. At most one environment per path is live at a
//! time, and at most one build per path executes at a time: concurrent
//! requests for an uncached path share a per-path gate and the late callers
//! reuse the winner's result.
//!
//! Freshness is checked at most once per `revalidate_interval` so the hot
//! path stays free of filesystem stats.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};

use filebase_common::Result;

use crate::environment::{Environment, EnvironmentBuilder};

/// Anything that can build an environment for a path.
///
/// The production source is [`EnvironmentBuilder`]; tests substitute counting
/// doubles to observe build behavior.
pub trait EnvironmentSource: Send + Sync {
    fn build(&self, path: &Path) -> impl Future<Output = Result<Environment>> + Send;
}

impl EnvironmentSource for EnvironmentBuilder {
    fn build(&self, path: &Path) -> impl Future<Output = Result<Environment>> + Send {
        async move { self.build_sync(path) }
    }
}

/// Tuning knobs for the bank.
#[derive(Debug, Clone)]
pub struct BankConfig {
    /// Minimum time between freshness checks for one entry.
    pub revalidate_interval: Duration,
    /// Entries not validated for this long are evicted by `maybe_clean`.
    pub max_lifetime: Duration,
    /// Minimum time between global cleanup sweeps.
    pub cleanup_interval: Duration,
    /// Compare every current mtime against every stored mtime instead of
    /// per-file. This reproduces the historical behavior, which can flag
    /// unchanged files as stale when target and companion mtimes naturally
    /// differ; the per-file comparison is the default.
    pub all_pairs_staleness: bool,
}

impl Default for BankConfig {
    fn default() -> Self {
        BankConfig {
            revalidate_interval: Duration::from_secs(1),
            max_lifetime: Duration::from_secs(300),
            cleanup_interval: Duration::from_secs(60),
            all_pairs_staleness: false,
        }
    }
}

struct BankEntry {
    env: Arc<Environment>,
    last_validated: Instant,
}

/// The environment cache.
pub struct EnvironmentBank<S> {
    source: S,
    config: BankConfig,
    entries: Mutex<HashMap<PathBuf, BankEntry>>,
    gates: Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>,
    last_cleanup: Mutex<Instant>,
}

impl<S: EnvironmentSource> EnvironmentBank<S> {
    pub fn new(source: S, config: BankConfig) -> Self {
        EnvironmentBank {
            source,
            config,
            entries: Mutex::new(HashMap::new()),
            gates: Mutex::new(HashMap::new()),
            last_cleanup: Mutex::new(Instant::now()),
        }
    }

    /// Returns the environment for `path`, building it if absent or stale.
    pub async fn get(&self, path: &Path) -> Result<Arc<Environment>> {
        self.get_with(path, true).await
    }

    /// Like [`get`](Self::get), with freshness validation optional.
    pub async fn get_with(&self, path: &Path, validate: bool) -> Result<Arc<Environment>> {
        if let Some(env) = self.cached(path, validate) {
            return Ok(env);
        }

        // One build per path: late callers block on the gate, then find the
        // fresh entry on the re-check instead of building again.
        let gate = {
            let mut gates = self.gates.lock().unwrap();
            gates
                .entry(path.to_owned())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        let _held = gate.lock().await;

        if let Some(env) = self.cached(path, validate) {
            return Ok(env);
        }

        tracing::debug!(path = %path.display(), "building environment");
        let built = self.source.build(path).await;
        self.gates.lock().unwrap().remove(path);
        let env = Arc::new(built?);

        self.entries.lock().unwrap().insert(
            path.to_owned(),
            BankEntry {
                env: env.clone(),
                last_validated: Instant::now(),
            },
        );
        Ok(env)
    }

    fn cached(&self, path: &Path, validate: bool) -> Option<Arc<Environment>> {
        let mut entries = self.entries.lock().unwrap();
        let entry = entries.get_mut(path)?;

        if !validate || entry.last_validated.elapsed() < self.config.revalidate_interval {
            return Some(entry.env.clone());
        }

        entry.last_validated = Instant::now();
        if self.is_current(&entry.env) {
            Some(entry.env.clone())
        } else {
            tracing::debug!(path = %path.display(), "environment stale, discarding");
            entries.remove(path);
            None
        }
    }

    /// Compares current backing-file mtimes against the stored fingerprint.
    /// A vanished or newly-appeared backing file always counts as stale.
    fn is_current(&self, env: &Environment) -> bool {
        let Ok(source_mtime) = modified_time(env.source_path()) else {
            return false;
        };
        let companion_exists = env.companion_path().is_file();
        if companion_exists != env.has_companion() {
            return false;
        }

        let mut current = vec![source_mtime];
        if companion_exists {
            let Ok(companion_mtime) = modified_time(env.companion_path()) else {
                return false;
            };
            current.push(companion_mtime);
        }

        let stored = env.fingerprint();
        if self.config.all_pairs_staleness {
            !current
                .iter()
                .any(|c| stored.iter().any(|s| c > s))
        } else {
            current.len() == stored.len()
                && !current.iter().zip(stored).any(|(c, s)| c > s)
        }
    }

    /// Evicts entries whose last validation is older than `max_lifetime`.
    ///
    /// Called opportunistically on each request; rate-limited to one sweep
    /// per `cleanup_interval`.
    pub fn maybe_clean(&self) {
        {
            let mut last = self.last_cleanup.lock().unwrap();
            if last.elapsed() < self.config.cleanup_interval {
                return;
            }
            *last = Instant::now();
        }
        let mut entries = self.entries.lock().unwrap();
        let before = entries.len();
        let max_lifetime = self.config.max_lifetime;
        entries.retain(|_, entry| entry.last_validated.elapsed() <= max_lifetime);
        let evicted = before - entries.len();
        if evicted > 0 {
            tracing::debug!(evicted, "environment bank cleanup");
        }
    }

    /// Drops every entry unconditionally.
    pub fn reset(&self) {
        self.entries.lock().unwrap().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn modified_time(path: &Path) -> std::io::Result<SystemTime> {
    std::fs::metadata(path)?.modified()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::CapabilityRegistry;
    use std::fs;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn builder() -> EnvironmentBuilder {
        EnvironmentBuilder::new(Arc::new(CapabilityRegistry::new()), "code.js", "v1")
    }

    fn write_site(dir: &Path, companion: Option<&str>) -> PathBuf {
        let target = dir.join("index.html");
        fs::write(&target, "<html></html>").unwrap();
        if let Some(source) = companion {
            fs::write(dir.join("index.code.js"), source).unwrap();
        }
        target
    }

    fn advance_mtime(path: &Path, forward: Duration) {
        let file = fs::OpenOptions::new().append(true).open(path).unwrap();
        file.set_modified(SystemTime::now() + forward).unwrap();
    }

    /// Counts builds; delegates construction to the real builder.
    struct CountingSource {
        builder: EnvironmentBuilder,
        builds: AtomicUsize,
        delay: Duration,
    }

    impl CountingSource {
        fn new(delay: Duration) -> Self {
            CountingSource {
                builder: builder(),
                builds: AtomicUsize::new(0),
                delay,
            }
        }
    }

    impl EnvironmentSource for CountingSource {
        fn build(&self, path: &Path) -> impl std::future::Future<Output = Result<Environment>> + Send {
            async move {
                self.builds.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(self.delay).await;
                self.builder.build_sync(path)
            }
        }
    }

    #[tokio::test]
    async fn test_identical_environment_within_revalidation_interval() {
        let dir = tempfile::tempdir().unwrap();
        let target = write_site(dir.path(), Some("page.register('v', 1);"));

        let bank = EnvironmentBank::new(
            builder(),
            BankConfig {
                revalidate_interval: Duration::from_secs(3600),
                ..BankConfig::default()
            },
        );

        let first = bank.get(&target).await.unwrap();
        let second = bank.get(&target).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(bank.len(), 1);
    }

    #[tokio::test]
    async fn test_rebuild_after_companion_mtime_advances() {
        let dir = tempfile::tempdir().unwrap();
        let target = write_site(dir.path(), Some("page.register('v', 1);"));
        let companion = dir.path().join("index.code.js");

        let bank = EnvironmentBank::new(
            builder(),
            BankConfig {
                revalidate_interval: Duration::ZERO,
                ..BankConfig::default()
            },
        );

        let first = bank.get(&target).await.unwrap();
        assert_eq!(first.variables()["v"], serde_json::json!(1));

        fs::write(&companion, "page.register('v', 2);").unwrap();
        advance_mtime(&companion, Duration::from_secs(10));

        let second = bank.get(&target).await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(second.variables()["v"], serde_json::json!(2));
    }

    #[tokio::test]
    async fn test_unchanged_files_stay_cached_across_revalidation() {
        let dir = tempfile::tempdir().unwrap();
        let target = write_site(dir.path(), Some("page.register('v', 1);"));

        let bank = EnvironmentBank::new(
            builder(),
            BankConfig {
                revalidate_interval: Duration::ZERO,
                ..BankConfig::default()
            },
        );

        let first = bank.get(&target).await.unwrap();
        let second = bank.get(&target).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn test_all_pairs_comparison_reproduces_false_staleness() {
        let dir = tempfile::tempdir().unwrap();
        let target = write_site(dir.path(), Some("page.register('v', 1);"));
        let companion = dir.path().join("index.code.js");

        // companion naturally older than the target: nothing has changed,
        // but target-mtime > companion-mtime trips the all-pairs check
        let file = fs::OpenOptions::new().append(true).open(&companion).unwrap();
        file.set_modified(SystemTime::now() - Duration::from_secs(3600))
            .unwrap();

        let config = BankConfig {
            revalidate_interval: Duration::ZERO,
            all_pairs_staleness: true,
            ..BankConfig::default()
        };
        let bank = EnvironmentBank::new(builder(), config);
        let first = bank.get(&target).await.unwrap();
        let second = bank.get(&target).await.unwrap();
        assert!(
            !Arc::ptr_eq(&first, &second),
            "all-pairs comparison should have discarded the entry"
        );

        // the default per-file comparison keeps it
        let aligned = EnvironmentBank::new(
            builder(),
            BankConfig {
                revalidate_interval: Duration::ZERO,
                ..BankConfig::default()
            },
        );
        let first = aligned.get(&target).await.unwrap();
        let second = aligned.get(&target).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn test_companion_appearing_invalidates() {
        let dir = tempfile::tempdir().unwrap();
        let target = write_site(dir.path(), None);

        let bank = EnvironmentBank::new(
            builder(),
            BankConfig {
                revalidate_interval: Duration::ZERO,
                ..BankConfig::default()
            },
        );

        let first = bank.get(&target).await.unwrap();
        assert!(!first.has_companion());

        fs::write(dir.path().join("index.code.js"), "page.register('v', 7);").unwrap();
        let second = bank.get(&target).await.unwrap();
        assert!(second.has_companion());
        assert_eq!(second.variables()["v"], serde_json::json!(7));
    }

    #[tokio::test]
    async fn test_concurrent_gets_build_exactly_once() {
        let dir = tempfile::tempdir().unwrap();
        let target = write_site(dir.path(), Some("page.register('v', 1);"));

        let bank = Arc::new(EnvironmentBank::new(
            CountingSource::new(Duration::from_millis(50)),
            BankConfig::default(),
        ));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let bank = bank.clone();
            let target = target.clone();
            handles.push(tokio::spawn(async move { bank.get(&target).await }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(bank.source.builds.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_skip_validation_returns_cached_entry() {
        let dir = tempfile::tempdir().unwrap();
        let target = write_site(dir.path(), None);

        let bank = EnvironmentBank::new(
            builder(),
            BankConfig {
                revalidate_interval: Duration::ZERO,
                ..BankConfig::default()
            },
        );
        let first = bank.get(&target).await.unwrap();

        // delete the backing file: validation would discard the entry
        fs::remove_file(&target).unwrap();
        let second = bank.get_with(&target, false).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn test_maybe_clean_evicts_expired_entries() {
        let dir = tempfile::tempdir().unwrap();
        let target = write_site(dir.path(), None);

        let bank = EnvironmentBank::new(
            builder(),
            BankConfig {
                revalidate_interval: Duration::from_secs(3600),
                max_lifetime: Duration::from_millis(5),
                cleanup_interval: Duration::ZERO,
                all_pairs_staleness: false,
            },
        );
        bank.get(&target).await.unwrap();
        assert_eq!(bank.len(), 1);

        std::thread::sleep(Duration::from_millis(20));
        bank.maybe_clean();
        assert!(bank.is_empty());
    }

    #[tokio::test]
    async fn test_cleanup_respects_minimum_interval() {
        let dir = tempfile::tempdir().unwrap();
        let target = write_site(dir.path(), None);

        let bank = EnvironmentBank::new(
            builder(),
            BankConfig {
                revalidate_interval: Duration::from_secs(3600),
                max_lifetime: Duration::ZERO,
                cleanup_interval: Duration::from_secs(3600),
                all_pairs_staleness: false,
            },
        );
        bank.get(&target).await.unwrap();

        // the sweep interval has not elapsed since bank creation
        bank.maybe_clean();
        assert_eq!(bank.len(), 1);
    }

    #[tokio::test]
    async fn test_reset_drops_everything() {
        let dir = tempfile::tempdir().unwrap();
        let target = write_site(dir.path(), None);

        let bank = EnvironmentBank::new(builder(), BankConfig::default());
        bank.get(&target).await.unwrap();
        assert_eq!(bank.len(), 1);
        bank.reset();
        assert!(bank.is_empty());
    }
}
