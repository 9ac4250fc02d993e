#[cfg(not(target_pointer_width = "64"))]
compile_error!("segpool supports only 64-bit targets.");

#[cfg(not(any(unix, loom, miri)))]
compile_error!("segpool needs a unix virtual-memory API (mmap/mprotect/madvise).");

pub(crate) mod sync;

// public module: contains implementation details (hidden via pub(crate))
// and TEST_MUTEX (public for tests)
pub mod memory;

// allocator
pub use memory::multiplexer::{HeaderedMultiplexer, HeaderlessMultiplexer, Owner, PoolMultiplexer};
#[cfg(not(loom))]
pub use memory::global::GlobalSegmentAllocator;

// framing/size classes
pub use memory::framing::{
    FramingPolicy, MAX_POOL_UNIT, NoHeader, POOL_CLASS_COUNT, WORD, WithHeader, class_of,
};

// pages/fallback
pub use memory::fallback::{FallbackAlloc, SystemFallback};
pub use memory::provider::{PageSource, REGION_SIZE, VirtualBlockProvider};
pub use memory::vm::{PlatformVmOps, VmOps};

// config/stats
pub use memory::config::PoolConfig;
pub use memory::stats::{ClassStats, Counter, MultiplexerStats, TOTAL_COMMITTED, TOTAL_RESERVED};

// errors
pub use memory::vm::VmError;
