use bitflags::bitflags;

pub const DEFAULT_CACHE_CAPACITY: usize = 1024;

bitflags! {
    /// Environment-wide open flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EnvFlags: u32 {
        /// No freelist, no durable writes; freed space is simply released.
        const IN_MEMORY = 1;
        /// Rejects allocations and suppresses freelist creation.
        const READ_ONLY = 2;
        /// Never map the file; always go through buffered reads.
        const DISABLE_MMAP = 4;
        /// Every page write is synced to stable storage.
        const WRITE_THROUGH = 8;
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Cache capacity in pages. The cache may temporarily exceed this while
    /// pages are pinned; `purge_cache` brings it back down.
    pub cache_capacity: usize,
    pub use_mmap: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            use_mmap: true,
        }
    }
}

impl Config {
    /// Large cache for read-heavy workloads.
    pub fn production() -> Self {
        Self {
            cache_capacity: 16 * 1024,
            use_mmap: true,
        }
    }

    /// Tiny cache; forces eviction early. Useful for exercising the purge
    /// path.
    pub fn small_cache() -> Self {
        Self {
            cache_capacity: 16,
            use_mmap: false,
        }
    }
}
