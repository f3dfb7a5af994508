//! Three-tier buffer pool: disk source, CPU tier, GPU tier
//!
//! Chunks are keyed `(table, column, fragment)` vectors so whole-table and
//! whole-column deletes are prefix operations. Each tier is a list of
//! fixed-size slabs carved into segment lists with pin counts and an LRU
//! eviction clock (see [`tier`]). Concurrent getters of the same absent
//! chunk block on a per-key condition variable while a single producer
//! fetches from the parent tier; immutable sources short-circuit through the
//! zero-copy path without occupying pool pages.
//!
//! References:
//! - Leis et al. (2014): morsel-driven parallelism motivates pin-per-kernel
//! - Funke et al. (2018): GPU paging for out-of-core workloads

pub mod tier;

use crate::error::{Error, Result};
use crate::storage::Catalog;
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tier::TierMgr;
use tracing::debug;

/// Hierarchical chunk identity: `[table, column, fragment]` (longer keys are
/// legal; prefix deletes match on any leading run).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChunkKey(Vec<u32>);

impl ChunkKey {
    /// Key for one column chunk of one fragment.
    #[must_use]
    pub fn chunk(table: u32, column: u32, fragment: u32) -> Self {
        Self(vec![table, column, fragment])
    }

    /// Key prefix covering a whole table.
    #[must_use]
    pub fn table_prefix(table: u32) -> Self {
        Self(vec![table])
    }

    /// Whether `prefix` is a leading run of this key.
    #[must_use]
    pub fn starts_with(&self, prefix: &Self) -> bool {
        self.0.starts_with(&prefix.0)
    }

    /// Key components.
    #[must_use]
    pub fn parts(&self) -> &[u32] {
        &self.0
    }
}

impl From<Vec<u32>> for ChunkKey {
    fn from(parts: Vec<u32>) -> Self {
        Self(parts)
    }
}

/// Memory level of a pooled buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryLevel {
    /// CPU pageable memory
    Cpu,
    /// GPU device memory (host-shadowed for staging)
    Gpu,
}

/// Bottom-tier chunk provider: the disk file store, or an immutable
/// in-memory source offering zero-copy tokens.
pub trait ChunkSource: Send + Sync {
    /// Fetch a chunk's bytes, copying.
    fn fetch(&self, key: &ChunkKey) -> Option<Arc<Vec<u8>>>;

    /// Zero-copy token for an immutable chunk, when supported.
    fn zero_copy(&self, key: &ChunkKey) -> Option<Arc<Vec<u8>>> {
        let _ = key;
        None
    }
}

impl ChunkSource for Catalog {
    fn fetch(&self, key: &ChunkKey) -> Option<Arc<Vec<u8>>> {
        let &[table, column, fragment] = key.parts() else {
            return None;
        };
        self.fetch_chunk(table, column as usize, fragment)
    }

    fn zero_copy(&self, key: &ChunkKey) -> Option<Arc<Vec<u8>>> {
        // catalog chunks are immutable for the query's lifetime
        self.fetch(key)
    }
}

/// Disk tier: one file per chunk under a base directory.
#[derive(Debug)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    /// File store rooted at `dir` (created if absent).
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn path_for(&self, key: &ChunkKey) -> PathBuf {
        let name: Vec<String> = key.parts().iter().map(u32::to_string).collect();
        self.dir.join(name.join("_"))
    }

    /// Persist a chunk.
    pub fn put(&self, key: &ChunkKey, bytes: &[u8]) -> Result<()> {
        std::fs::write(self.path_for(key), bytes)?;
        Ok(())
    }
}

impl ChunkSource for FileStore {
    fn fetch(&self, key: &ChunkKey) -> Option<Arc<Vec<u8>>> {
        std::fs::read(self.path_for(key)).ok().map(Arc::new)
    }
}

/// Pool sizing knobs, bytes.
#[derive(Debug, Clone, Copy)]
pub struct PoolSizes {
    /// Page granularity
    pub page_size: usize,
    /// Smallest slab the halving retry loop will attempt
    pub min_slab_size: usize,
    /// Preferred slab size
    pub max_slab_size: usize,
    /// CPU tier capacity
    pub cpu_pool_size: usize,
    /// GPU tier capacity (device memory stand-in)
    pub gpu_pool_size: usize,
}

impl Default for PoolSizes {
    fn default() -> Self {
        Self {
            page_size: 512,
            min_slab_size: 1 << 16,
            max_slab_size: 1 << 22,
            cpu_pool_size: 1 << 28,
            gpu_pool_size: 1 << 26,
        }
    }
}

/// Per-device memory snapshot consumed by the dispatcher's byte budget.
#[derive(Debug, Clone, Copy)]
pub struct MemoryInfo {
    /// Tier capacity in bytes
    pub total_bytes: usize,
    /// Bytes currently backed by slabs
    pub allocated_bytes: usize,
}

#[derive(Default)]
struct InFlight {
    done: Mutex<bool>,
    cv: Condvar,
}

/// The three-tier paged buffer pool.
pub struct BufferPool {
    source: Arc<dyn ChunkSource>,
    cpu: Mutex<TierMgr>,
    gpu: Mutex<TierMgr>,
    zero_copy: Mutex<HashMap<ChunkKey, Arc<Vec<u8>>>>,
    // keyed per level: a GPU fault-in recursively faults the CPU tier for
    // the same chunk and must not wait on its own marker
    in_flight: Mutex<HashMap<(MemoryLevel, ChunkKey), Arc<InFlight>>>,
    sizes: PoolSizes,
}

impl BufferPool {
    /// Pool over a bottom-tier source.
    #[must_use]
    pub fn new(source: Arc<dyn ChunkSource>, sizes: PoolSizes) -> Self {
        Self {
            source,
            cpu: Mutex::new(TierMgr::new(
                "cpu",
                sizes.page_size,
                sizes.min_slab_size,
                sizes.max_slab_size,
                sizes.cpu_pool_size,
            )),
            gpu: Mutex::new(TierMgr::new(
                "gpu",
                sizes.page_size,
                sizes.min_slab_size,
                sizes.max_slab_size,
                sizes.gpu_pool_size,
            )),
            zero_copy: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
            sizes,
        }
    }

    fn tier(&self, level: MemoryLevel) -> &Mutex<TierMgr> {
        match level {
            MemoryLevel::Cpu => &self.cpu,
            MemoryLevel::Gpu => &self.gpu,
        }
    }

    /// Memory snapshot for a level.
    #[must_use]
    pub fn memory_info(&self, level: MemoryLevel) -> MemoryInfo {
        let total_bytes = match level {
            MemoryLevel::Cpu => self.sizes.cpu_pool_size,
            MemoryLevel::Gpu => self.sizes.gpu_pool_size,
        };
        MemoryInfo {
            total_bytes,
            allocated_bytes: self.tier(level).lock().allocated_bytes(),
        }
    }

    /// Create a fresh pinned buffer. Errors when the key already exists at
    /// this level.
    pub fn create_buffer(
        self: &Arc<Self>,
        level: MemoryLevel,
        key: &ChunkKey,
        size: usize,
    ) -> Result<PinnedChunk> {
        let mut tier = self.tier(level).lock();
        if tier.find_chunk(key).is_some() {
            return Err(Error::BufferPool(format!(
                "create of existing chunk {key:?}"
            )));
        }
        tier.reserve(key, size)?;
        drop(tier);
        Ok(PinnedChunk::tier(Arc::clone(self), level, key.clone()))
    }

    /// Write bytes into a resident buffer.
    pub fn write_buffer(&self, level: MemoryLevel, key: &ChunkKey, bytes: &[u8]) -> Result<()> {
        let mut tier = self.tier(level).lock();
        let loc = tier
            .find_chunk(key)
            .ok_or_else(|| Error::BufferPool(format!("write to absent chunk {key:?}")))?;
        tier.write(loc, bytes)
    }

    /// Pin a chunk at `level`, faulting it in from the parent tier when
    /// absent or smaller than `size`. Concurrent getters wait on a per-key
    /// condition variable instead of duplicating the fetch.
    pub fn get_buffer(
        self: &Arc<Self>,
        level: MemoryLevel,
        key: &ChunkKey,
        size: usize,
    ) -> Result<PinnedChunk> {
        loop {
            if level == MemoryLevel::Cpu {
                if let Some(bytes) = self.zero_copy.lock().get(key) {
                    return Ok(PinnedChunk::zero_copy(Arc::clone(bytes)));
                }
            }
            {
                let mut tier = self.tier(level).lock();
                if let Some(loc) = tier.find_chunk(key) {
                    if tier.segment(loc).size_bytes >= size {
                        tier.pin(loc);
                        return Ok(PinnedChunk::tier(Arc::clone(self), level, key.clone()));
                    }
                    // resident but short: drop and refetch the full chunk
                    if tier.segment(loc).pin_count == 0 {
                        tier.delete_chunk(key)?;
                    } else {
                        return Err(Error::BufferPool(format!(
                            "short chunk {key:?} is pinned and cannot grow"
                        )));
                    }
                }
            }

            // single-producer fetch under the per-key condvar
            let flight_key = (level, key.clone());
            let (flight, producer) = {
                let mut map = self.in_flight.lock();
                match map.get(&flight_key) {
                    Some(f) => (Arc::clone(f), false),
                    None => {
                        let f = Arc::new(InFlight::default());
                        map.insert(flight_key.clone(), Arc::clone(&f));
                        (f, true)
                    }
                }
            };

            if !producer {
                let mut done = flight.done.lock();
                while !*done {
                    flight.cv.wait(&mut done);
                }
                continue; // re-check residency
            }

            let result = self.fault_in(level, key, size);

            {
                let mut done = flight.done.lock();
                *done = true;
                flight.cv.notify_all();
            }
            self.in_flight.lock().remove(&flight_key);

            result?;
        }
    }

    fn fault_in(self: &Arc<Self>, level: MemoryLevel, key: &ChunkKey, size: usize) -> Result<()> {
        let bytes: Arc<Vec<u8>> = match level {
            MemoryLevel::Cpu => {
                if let Some(token) = self.source.zero_copy(key) {
                    // immutable source: wrap, don't copy into pool pages
                    debug!(?key, "zero-copy fault-in");
                    self.zero_copy.lock().insert(key.clone(), token);
                    return Ok(());
                }
                self.source
                    .fetch(key)
                    .ok_or_else(|| Error::BufferPool(format!("chunk {key:?} not in source")))?
            }
            MemoryLevel::Gpu => {
                let parent = self.get_buffer(MemoryLevel::Cpu, key, size)?;
                Arc::new(parent.bytes())
            }
        };

        let mut tier = self.tier(level).lock();
        let loc = tier.reserve(key, bytes.len())?;
        tier.write(loc, &bytes)?;
        tier.unpin(loc); // the retry loop pins for the caller
        Ok(())
    }

    /// Wrap externally owned memory under a key without copying.
    pub fn zero_copy_buffer(&self, key: &ChunkKey, token: Arc<Vec<u8>>) {
        self.zero_copy.lock().insert(key.clone(), token);
    }

    /// Unpin a chunk previously returned by get/create.
    pub(crate) fn unpin(&self, level: MemoryLevel, key: &ChunkKey) {
        let mut tier = self.tier(level).lock();
        if let Some(loc) = tier.find_chunk(key) {
            tier.unpin(loc);
        }
    }

    /// Delete one chunk at every level.
    pub fn delete_buffer(&self, key: &ChunkKey) -> Result<()> {
        self.zero_copy.lock().remove(key);
        self.cpu.lock().delete_chunk(key)?;
        self.gpu.lock().delete_chunk(key)
    }

    /// Delete all chunks whose key starts with `prefix`, every level.
    pub fn delete_buffers_with_prefix(&self, prefix: &ChunkKey) {
        self.zero_copy
            .lock()
            .retain(|k, _| !k.starts_with(prefix));
        self.cpu.lock().delete_chunks_with_prefix(prefix);
        self.gpu.lock().delete_chunks_with_prefix(prefix);
    }
}

enum PinInner {
    Tier {
        pool: Arc<BufferPool>,
        level: MemoryLevel,
        key: ChunkKey,
    },
    ZeroCopy(Arc<Vec<u8>>),
}

/// A pinned view of one chunk. Dropping the handle unpins; eviction is only
/// possible once every handle is gone.
pub struct PinnedChunk {
    inner: PinInner,
}

impl std::fmt::Debug for PinnedChunk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.inner {
            PinInner::Tier { level, key, .. } => f
                .debug_struct("PinnedChunk::Tier")
                .field("level", level)
                .field("key", key)
                .finish(),
            PinInner::ZeroCopy(_) => f.debug_tuple("PinnedChunk::ZeroCopy").finish(),
        }
    }
}

impl PinnedChunk {
    fn tier(pool: Arc<BufferPool>, level: MemoryLevel, key: ChunkKey) -> Self {
        Self {
            inner: PinInner::Tier { pool, level, key },
        }
    }

    fn zero_copy(bytes: Arc<Vec<u8>>) -> Self {
        Self {
            inner: PinInner::ZeroCopy(bytes),
        }
    }

    /// Run `f` over the chunk bytes.
    pub fn with_bytes<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        match &self.inner {
            PinInner::Tier { pool, level, key } => {
                let tier = pool.tier(*level).lock();
                let loc = tier.find_chunk(key).expect("pinned chunk is resident");
                f(tier.read(loc))
            }
            PinInner::ZeroCopy(bytes) => f(bytes),
        }
    }

    /// Copy the chunk bytes out.
    #[must_use]
    pub fn bytes(&self) -> Vec<u8> {
        self.with_bytes(<[u8]>::to_vec)
    }

    /// Shared bytes: the zero-copy path clones its `Arc`, tier-resident
    /// chunks copy once.
    #[must_use]
    pub fn arc_bytes(&self) -> Arc<Vec<u8>> {
        match &self.inner {
            PinInner::ZeroCopy(bytes) => Arc::clone(bytes),
            PinInner::Tier { .. } => Arc::new(self.bytes()),
        }
    }
}

impl Drop for PinnedChunk {
    fn drop(&mut self) {
        if let PinInner::Tier { pool, level, key } = &self.inner {
            pool.unpin(*level, key);
        }
    }
}
