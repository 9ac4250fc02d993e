use crate::memory::provider::REGION_SIZE;
use crate::memory::vm::VmError;

/// Configuration for `PoolMultiplexer`. All fields have sensible defaults.
/// Set at init time via `PoolMultiplexer::with_config()`.
///
/// Water marks count whole pages' worth of units of the class in question,
/// so they scale with the unit size.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PoolConfig {
    /// Address space reserved per region by the default page source.
    /// Must be a multiple of the OS page size. Default: 1 MiB.
    pub region_size: usize,

    /// A starved thread pool refills from the cache only while the cache
    /// holds more than this. Default: 8.
    pub cache_low_water_pages: usize,

    /// Batch moved from the cache into a starved thread pool. Default: 4.
    pub cache_refill_pages: usize,

    /// A thread pool holding at least this many free units spills into the
    /// cache. Default: 16.
    pub thread_high_water_pages: usize,

    /// Batch moved from a thread pool into the cache on spill. Default: 8.
    pub thread_spill_pages: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            region_size: REGION_SIZE,
            cache_low_water_pages: 8,
            cache_refill_pages: 4,
            thread_high_water_pages: 16,
            thread_spill_pages: 8,
        }
    }
}

impl PoolConfig {
    pub(crate) fn validate(&self) -> Result<(), VmError> {
        let invalid = |msg: &str| Err(VmError::InitializationFailed(msg.to_owned()));
        if self.region_size == 0 {
            return invalid("region_size must be non-zero");
        }
        if self.cache_low_water_pages == 0 || self.cache_refill_pages == 0 {
            return invalid("cache water marks must be non-zero");
        }
        if self.thread_high_water_pages == 0 || self.thread_spill_pages == 0 {
            return invalid("thread water marks must be non-zero");
        }
        if self.thread_spill_pages > self.thread_high_water_pages {
            return invalid("thread_spill_pages exceeds thread_high_water_pages");
        }
        Ok(())
    }
}
