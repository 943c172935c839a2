//! Pipeline caching
//!
//! Maps a [`PipelineKey`] to its compiled [`Pipeline`]. Pipelines are
//! created on first use and kept for the lifetime of the cache; there is no
//! eviction.
//!
//! # Locking
//!
//! - Hit: shared read lock on the map, then an `Arc` clone.
//! - Miss: take the compile mutex, check the map again, compile, insert
//!   under a short write lock.
//!
//! The second check under the compile mutex guarantees the compile oracle
//! runs at most once per key, even when many threads miss together. Failed
//! compiles are not cached, so a later request retries.

use super::{Pipeline, PipelineKey};
use crate::error::Result;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

/// Counters describing cache traffic.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    /// Successful compiles (one per entry)
    pub compiles: u64,
}

/// Thread-safe lookup-or-compile cache.
///
/// ```text
/// use fulcrum_backends::pipeline::PipelineCache;
///
/// static CACHE: PipelineCache = PipelineCache::new();
///
/// let pipeline = CACHE.get_or_compile(&key, |key| build(key))?;
/// ```
pub struct PipelineCache {
    entries: OnceLock<RwLock<HashMap<PipelineKey, Arc<Pipeline>>>>,
    compile_lock: Mutex<()>,
    hits: AtomicU64,
    misses: AtomicU64,
    compiles: AtomicU64,
}

impl PipelineCache {
    /// Create a new empty cache
    pub const fn new() -> Self {
        Self {
            entries: OnceLock::new(),
            compile_lock: parking_lot::const_mutex(()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            compiles: AtomicU64::new(0),
        }
    }

    fn map(&self) -> &RwLock<HashMap<PipelineKey, Arc<Pipeline>>> {
        self.entries.get_or_init(|| RwLock::new(HashMap::new()))
    }

    /// Cached pipeline for `key`, without compiling.
    pub fn get(&self, key: &PipelineKey) -> Option<Arc<Pipeline>> {
        self.map().read().get(key).cloned()
    }

    /// Cached pipeline for `key`, compiling it with `compile` on first use.
    ///
    /// `compile` runs at most once per key across all threads, unless it
    /// fails, in which case nothing is cached.
    pub fn get_or_compile<F>(&self, key: &PipelineKey, compile: F) -> Result<Arc<Pipeline>>
    where
        F: FnOnce(&PipelineKey) -> Result<Pipeline>,
    {
        // Fast path: read lock for cache lookup
        if let Some(pipeline) = self.map().read().get(key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(Arc::clone(pipeline));
        }

        // Slow path: serialize compiles, then re-check
        let _compiling = self.compile_lock.lock();
        if let Some(pipeline) = self.map().read().get(key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(Arc::clone(pipeline));
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let pipeline = Arc::new(compile(key)?);
        self.compiles.fetch_add(1, Ordering::Relaxed);

        self.map().write().insert(key.clone(), Arc::clone(&pipeline));
        Ok(pipeline)
    }

    /// Get the number of cached pipelines
    pub fn len(&self) -> usize {
        self.entries.get().map(|c| c.read().len()).unwrap_or(0)
    }

    /// Check if the cache is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            compiles: self.compiles.load(Ordering::Relaxed),
        }
    }

    /// Every cached key, in no particular order.
    pub fn keys(&self) -> Vec<PipelineKey> {
        self.entries
            .get()
            .map(|c| c.read().keys().cloned().collect())
            .unwrap_or_default()
    }
}

impl Default for PipelineCache {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for PipelineCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineCache").field("stats", &self.stats()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::common::TensorAccess;
    use crate::error::BackendError;
    use crate::pipeline::{CompiledKernel, KernelBase, KernelFamily, PipelineMeta, SpecConstants};
    use crate::tensor::{DataType, TensorRef};
    use std::sync::Barrier;

    #[derive(Debug)]
    struct Noop(u32);

    impl CompiledKernel for Noop {
        fn launch(&self, _group: &[TensorRef], _access: &dyn TensorAccess) -> Result<()> {
            Ok(())
        }
    }

    fn key(ty: DataType, flag: bool) -> PipelineKey {
        PipelineKey::new(
            KernelBase::new(KernelFamily::SoftMax).with_types(&[ty]),
            SpecConstants::new().with_bool(1, flag),
        )
    }

    fn build(key: &PipelineKey, tag: u32) -> Result<Pipeline> {
        Ok(Pipeline::new(key.clone(), PipelineMeta::with_smem(128), Arc::new(Noop(tag))))
    }

    #[test]
    fn test_cache_basic() {
        let cache = PipelineCache::new();
        let k = key(DataType::F32, false);

        let first = cache.get_or_compile(&k, |k| build(k, 1)).unwrap();
        let second = cache.get_or_compile(&k, |k| build(k, 2)).unwrap();

        // Second request is served from the cache, not the second creator
        assert!(Arc::ptr_eq(&first, &second));
        assert!(format!("{:?}", second.kernel()).contains("Noop(1)"));
        assert_eq!(second.smem(), 128);
        assert_eq!(
            cache.stats(),
            CacheStats {
                entries: 1,
                hits: 1,
                misses: 1,
                compiles: 1
            }
        );
    }

    #[test]
    fn test_cache_multiple_keys() {
        let cache = PipelineCache::new();
        let a = cache.get_or_compile(&key(DataType::F32, false), |k| build(k, 1)).unwrap();
        let b = cache.get_or_compile(&key(DataType::F32, true), |k| build(k, 2)).unwrap();
        let c = cache.get_or_compile(&key(DataType::F16, false), |k| build(k, 3)).unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(cache.len(), 3);
        assert_eq!(cache.keys().len(), 3);
    }

    #[test]
    fn test_failures_are_not_cached() {
        let cache = PipelineCache::new();
        let k = key(DataType::F32, false);
        let err = cache
            .get_or_compile(&k, |k| Err(BackendError::compile(&k.base, "boom")))
            .unwrap_err();
        assert!(matches!(err, BackendError::Compile { .. }));
        assert!(cache.is_empty());
        assert!(cache.get(&k).is_none());

        cache.get_or_compile(&k, |k| build(k, 1)).unwrap();
        assert_eq!(cache.stats().compiles, 1);
        assert_eq!(cache.stats().misses, 2);
    }

    #[test]
    fn test_concurrent_first_use_compiles_once() {
        const THREADS: usize = 16;
        let cache = Arc::new(PipelineCache::new());
        let barrier = Arc::new(Barrier::new(THREADS));
        let compiles = Arc::new(AtomicU64::new(0));

        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let barrier = Arc::clone(&barrier);
                let compiles = Arc::clone(&compiles);
                std::thread::spawn(move || {
                    barrier.wait();
                    cache
                        .get_or_compile(&key(DataType::F32, true), |k| {
                            compiles.fetch_add(1, Ordering::SeqCst);
                            std::thread::sleep(std::time::Duration::from_millis(5));
                            build(k, 7)
                        })
                        .unwrap()
                })
            })
            .collect();

        let pipelines: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(compiles.load(Ordering::SeqCst), 1);
        assert!(pipelines.iter().all(|p| Arc::ptr_eq(p, &pipelines[0])));
        assert_eq!(cache.stats().hits, THREADS as u64 - 1);
    }

    #[test]
    fn test_static_cache() {
        static CACHE: PipelineCache = PipelineCache::new();
        assert_eq!(CACHE.len(), 0);
        CACHE.get_or_compile(&key(DataType::I32, false), |k| build(k, 0)).unwrap();
        assert_eq!(CACHE.len(), 1);
    }
}
