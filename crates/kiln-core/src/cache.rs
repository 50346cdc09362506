//! Content-Addressable Cache for transform outputs
//!
//! Keys are derived from the operation name, a version salt and the
//! transform input, so bumping the salt invalidates every old entry without
//! a purge. Backend failures never surface as errors: a failed read is a
//! miss and a failed write is dropped.

use crate::diagnostic::{has_error, Diagnostic};
use crate::error::{KilnError, Result};
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::OnceCell;
use tracing::{debug, warn};

/// Storage medium behind the cache
pub trait CacheBackend: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn put(&self, key: &str, value: &str) -> Result<()>;
    fn clear(&self) -> Result<()>;
    fn len(&self) -> usize;
    fn size_on_disk(&self) -> u64 {
        0
    }
}

/// Durable backend, persists across sessions (sled DB)
pub struct SledBackend {
    db: sled::Db,
}

impl SledBackend {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        let db = sled::open(dir)?;
        Ok(Self { db })
    }
}

impl CacheBackend for SledBackend {
    fn get(&self, key: &str) -> Result<Option<String>> {
        match self.db.get(key.as_bytes())? {
            Some(data) => String::from_utf8(data.to_vec())
                .map(Some)
                .map_err(|e| KilnError::CacheIo(format!("corrupt entry {}: {}", key, e))),
            None => Ok(None),
        }
    }

    fn put(&self, key: &str, value: &str) -> Result<()> {
        self.db.insert(key.as_bytes(), value.as_bytes())?;
        self.db.flush()?;
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        self.db.clear()?;
        self.db.flush()?;
        Ok(())
    }

    fn len(&self) -> usize {
        self.db.len()
    }

    fn size_on_disk(&self) -> u64 {
        self.db.size_on_disk().unwrap_or(0)
    }
}

/// Session-only backend
#[derive(Default)]
pub struct MemoryBackend {
    entries: RwLock<HashMap<String, String>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CacheBackend for MemoryBackend {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let entries = self
            .entries
            .read()
            .map_err(|_| KilnError::CacheIo("memory cache poisoned".into()))?;
        Ok(entries.get(key).cloned())
    }

    fn put(&self, key: &str, value: &str) -> Result<()> {
        let mut entries = self
            .entries
            .write()
            .map_err(|_| KilnError::CacheIo("memory cache poisoned".into()))?;
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        let mut entries = self
            .entries
            .write()
            .map_err(|_| KilnError::CacheIo("memory cache poisoned".into()))?;
        entries.clear();
        Ok(())
    }

    fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }
}

/// Result of a (possibly shared) transform computation
#[derive(Debug, Clone, Default)]
pub struct Computed {
    /// `None` when the transform produced nothing usable
    pub output: Option<String>,
    pub diagnostics: Vec<Diagnostic>,
    pub from_cache: bool,
}

impl Computed {
    pub fn is_cacheable(&self) -> bool {
        self.output.is_some() && !has_error(&self.diagnostics)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
    pub size_on_disk: u64,
}

pub struct Cache {
    /// `None` when caching is disabled
    backend: Option<Box<dyn CacheBackend>>,
    in_flight: Mutex<HashMap<String, Arc<OnceCell<Computed>>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl Cache {
    pub fn new(backend: Box<dyn CacheBackend>) -> Self {
        Self {
            backend: Some(backend),
            in_flight: Mutex::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Box::new(MemoryBackend::new()))
    }

    /// Durable cache under `dir`
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::new(Box::new(SledBackend::open(dir)?)))
    }

    /// Cache that never stores anything
    pub fn disabled() -> Self {
        Self {
            backend: None,
            in_flight: Mutex::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.backend.is_some()
    }

    /// Deterministic key for `(operation, version_salt, input)`.
    ///
    /// Each component is length-prefixed before hashing so no two distinct
    /// triples feed the same byte stream to blake3.
    pub fn create_key<T: Serialize + ?Sized>(
        operation: &str,
        version_salt: &str,
        input: &T,
    ) -> Result<String> {
        let encoded = serde_json::to_vec(input)?;

        let mut hasher = blake3::Hasher::new();
        for part in [operation.as_bytes(), version_salt.as_bytes(), encoded.as_slice()] {
            hasher.update(&(part.len() as u64).to_le_bytes());
            hasher.update(part);
        }

        Ok(format!("{}_{}", operation, hasher.finalize().to_hex()))
    }

    pub fn get(&self, key: &str) -> Option<String> {
        let backend = self.backend.as_ref()?;
        match backend.get(key) {
            Ok(Some(value)) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(value)
            }
            Ok(None) => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            Err(e) => {
                warn!("Cache read failed for {}, treating as miss: {}", key, e);
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub fn put(&self, key: &str, value: &str) {
        let Some(backend) = self.backend.as_ref() else {
            return;
        };
        if let Err(e) = backend.put(key, value) {
            warn!("Cache write failed for {}: {}", key, e);
        }
    }

    /// Return the cached value for `key` or run `compute` once.
    ///
    /// Concurrent callers asking for the same key while a computation is
    /// running wait for it and share its result. The result is written to
    /// the backend only when it carries output and no error diagnostics.
    pub async fn get_or_compute<F, Fut>(&self, key: &str, compute: F) -> Computed
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Computed>,
    {
        if let Some(value) = self.get(key) {
            return Computed {
                output: Some(value),
                diagnostics: Vec::new(),
                from_cache: true,
            };
        }

        let cell = {
            let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
            Arc::clone(in_flight.entry(key.to_string()).or_default())
        };

        let this = self;
        let result = cell
            .get_or_init(|| async move {
                // another task may have finished and written between our miss and now
                if let Some(value) = this.backend.as_ref().and_then(|b| b.get(key).ok().flatten()) {
                    return Computed {
                        output: Some(value),
                        diagnostics: Vec::new(),
                        from_cache: true,
                    };
                }

                let computed = compute().await;
                if computed.is_cacheable() {
                    if let Some(output) = &computed.output {
                        this.put(key, output);
                    }
                } else {
                    debug!("Not caching {}: transform reported errors", key);
                }
                computed
            })
            .await
            .clone();

        let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        if in_flight.get(key).is_some_and(|c| Arc::ptr_eq(c, &cell)) {
            in_flight.remove(key);
        }

        result
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.backend.as_ref().map(|b| b.len()).unwrap_or(0),
            size_on_disk: self.backend.as_ref().map(|b| b.size_on_disk()).unwrap_or(0),
        }
    }

    pub fn clear(&self) -> Result<()> {
        match self.backend.as_ref() {
            Some(backend) => backend.clear(),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[derive(Serialize)]
    struct Input<'a> {
        text: &'a str,
        minify: bool,
    }

    #[test]
    fn test_key_is_deterministic() {
        let input = Input { text: "a{}", minify: true };
        let k1 = Cache::create_key("optimizeCss", "v1", &input).unwrap();
        let k2 = Cache::create_key("optimizeCss", "v1", &input).unwrap();
        assert_eq!(k1, k2);
        assert!(k1.starts_with("optimizeCss_"));
    }

    #[test]
    fn test_key_changes_with_each_component() {
        let input = Input { text: "a{}", minify: true };
        let base = Cache::create_key("optimizeCss", "v1", &input).unwrap();

        let other_op = Cache::create_key("transpile", "v1", &input).unwrap();
        let other_salt = Cache::create_key("optimizeCss", "v2", &input).unwrap();
        let other_input =
            Cache::create_key("optimizeCss", "v1", &Input { text: "b{}", minify: true }).unwrap();

        assert_ne!(base, other_op);
        assert_ne!(base, other_salt);
        assert_ne!(base, other_input);
    }

    #[test]
    fn test_key_components_do_not_bleed() {
        // "ab" + "c" must not collide with "a" + "bc"
        let k1 = Cache::create_key("ab", "c", "x").unwrap();
        let k2 = Cache::create_key("a", "bc", "x").unwrap();
        assert_ne!(k1.split('_').nth(1), k2.split('_').nth(1));
    }

    #[test]
    fn test_round_trip_and_miss_on_altered_input() {
        let cache = Cache::in_memory();
        let key = Cache::create_key("optimizeCss", "v1", "a { color: red }").unwrap();
        cache.put(&key, "a{color:red}");
        assert_eq!(cache.get(&key).as_deref(), Some("a{color:red}"));

        let altered = Cache::create_key("optimizeCss", "v1", "a { color: blue }").unwrap();
        assert_eq!(cache.get(&altered), None);

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.entries, 1);
    }

    #[test]
    fn test_disabled_cache_never_hits() {
        let cache = Cache::disabled();
        cache.put("k", "v");
        assert_eq!(cache.get("k"), None);
        assert!(!cache.is_enabled());
    }

    struct FailingBackend;

    impl CacheBackend for FailingBackend {
        fn get(&self, _key: &str) -> Result<Option<String>> {
            Err(KilnError::CacheIo("disk on fire".into()))
        }
        fn put(&self, _key: &str, _value: &str) -> Result<()> {
            Err(KilnError::CacheIo("disk on fire".into()))
        }
        fn clear(&self) -> Result<()> {
            Ok(())
        }
        fn len(&self) -> usize {
            0
        }
    }

    #[tokio::test]
    async fn test_backend_errors_degrade_to_recompute() {
        let cache = Cache::new(Box::new(FailingBackend));
        assert_eq!(cache.get("k"), None);

        let result = cache
            .get_or_compute("k", || async {
                Computed {
                    output: Some("fresh".into()),
                    ..Default::default()
                }
            })
            .await;
        assert_eq!(result.output.as_deref(), Some("fresh"));
        assert!(!result.from_cache);
    }

    #[tokio::test]
    async fn test_failed_result_is_not_cached() {
        let cache = Cache::in_memory();
        let calls = AtomicUsize::new(0);
        let calls = &calls;

        for _ in 0..2 {
            let result = cache
                .get_or_compute("k", || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Computed {
                        output: Some("partial".into()),
                        diagnostics: vec![Diagnostic::error("Style", "broken")],
                        from_cache: false,
                    }
                })
                .await;
            assert!(!result.from_cache);
        }

        // both attempts recomputed
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(cache.get("k"), None);
    }

    #[tokio::test]
    async fn test_concurrent_requests_share_one_computation() {
        let cache = Cache::in_memory();
        let calls = AtomicUsize::new(0);
        let calls = &calls;

        let compute = || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            Computed {
                output: Some("shared".into()),
                ..Default::default()
            }
        };

        let (a, b, c) = tokio::join!(
            cache.get_or_compute("k", compute),
            cache.get_or_compute("k", compute),
            cache.get_or_compute("k", compute),
        );

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        for r in [a, b, c] {
            assert_eq!(r.output.as_deref(), Some("shared"));
        }
        assert_eq!(cache.stats().entries, 1);
    }

    #[test]
    fn test_sled_backend_outlives_handle() {
        let dir = tempfile::tempdir().unwrap();
        let key = Cache::create_key("optimizeCss", "v1", "a{}").unwrap();
        {
            let cache = Cache::open(dir.path()).unwrap();
            cache.put(&key, "a{}");
        }
        let reopened = Cache::open(dir.path()).unwrap();
        assert_eq!(reopened.get(&key).as_deref(), Some("a{}"));

        reopened.clear().unwrap();
        assert_eq!(reopened.get(&key), None);
    }
}
