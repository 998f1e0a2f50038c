#![forbid(unsafe_code)]
//! Core identifiers, layout constants, and validated configuration.
//!
//! Every numeric identity in the system gets a unit-carrying newtype so
//! that block numbers, page addresses, and core ids cannot be mixed up
//! at call sites. Geometry is validated once, at construction
//! ([`CacheConfig::new`], [`MemoryLayout::new`]); the component crates
//! then rely on those invariants without re-checking.

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ── Layout constants ────────────────────────────────────────────────────────

/// Device block size in bytes. Must equal the buffer payload size.
pub const BLOCK_SIZE: u32 = 1024;

/// Physical page size in bytes.
pub const PAGE_SIZE: u32 = 4096;

/// Number of preallocated buffers in the cache pool.
pub const BUF_COUNT: usize = 30;

/// Number of independent cache buckets.
pub const BUCKET_COUNT: usize = 13;

/// Number of independent page free lists.
pub const FREE_LIST_COUNT: usize = 4;

/// Fill byte written over a page when it is freed, so that dangling
/// references read recognizable junk instead of stale data.
pub const FREED_FILL: u8 = 0x01;

/// Fill byte written over a page when it is allocated, so that reads of
/// uninitialized memory are visibly wrong rather than silently stale.
pub const ALLOC_FILL: u8 = 0x05;

// ── Identifiers ─────────────────────────────────────────────────────────────

/// Stable block-device identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DeviceId(pub u32);

/// Block number on a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockNumber(pub u64);

/// Physical address of a page frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PageAddr(pub u64);

impl PageAddr {
    /// Add a byte count, returning `None` on overflow.
    #[must_use]
    pub fn checked_add(self, bytes: u64) -> Option<Self> {
        self.0.checked_add(bytes).map(Self)
    }
}

/// Stable identifier of an execution core (or its host stand-in).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CoreId(pub u32);

// ── Configuration errors ────────────────────────────────────────────────────

/// Rejected configuration or geometry.
///
/// Converted into `KmemError::Config` at the component-crate boundary;
/// this crate stays independent of `kmem-error` to avoid cyclic
/// dependencies.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
}

fn valid_chunk_size(value: u32) -> bool {
    value.is_power_of_two() && (512..=65536).contains(&value)
}

// ── Buffer cache configuration ──────────────────────────────────────────────

/// Validated buffer cache geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    buckets: usize,
    buffers: usize,
    block_size: u32,
}

impl CacheConfig {
    /// Create a configuration if the geometry is sane.
    pub fn new(buckets: usize, buffers: usize, block_size: u32) -> Result<Self, ConfigError> {
        if buckets == 0 {
            return Err(ConfigError::InvalidField {
                field: "buckets",
                reason: "must be at least 1",
            });
        }
        if buffers == 0 {
            return Err(ConfigError::InvalidField {
                field: "buffers",
                reason: "must be at least 1",
            });
        }
        if !valid_chunk_size(block_size) {
            return Err(ConfigError::InvalidField {
                field: "block_size",
                reason: "must be a power of two in 512..=65536",
            });
        }
        Ok(Self {
            buckets,
            buffers,
            block_size,
        })
    }

    /// The geometry the kernel ships with.
    #[must_use]
    pub fn kernel_default() -> Self {
        Self {
            buckets: BUCKET_COUNT,
            buffers: BUF_COUNT,
            block_size: BLOCK_SIZE,
        }
    }

    #[must_use]
    pub fn buckets(self) -> usize {
        self.buckets
    }

    #[must_use]
    pub fn buffers(self) -> usize {
        self.buffers
    }

    #[must_use]
    pub fn block_size(self) -> u32 {
        self.block_size
    }
}

// ── Physical memory layout ──────────────────────────────────────────────────

/// Validated physical memory range and its free-list partitioning.
///
/// The usable range `[base, base + pages * page_size)` is divided into
/// `lists` contiguous sub-ranges of `pages / lists` pages each; the
/// remainder pages at the top of the range belong to list 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryLayout {
    base: PageAddr,
    page_size: u32,
    pages: usize,
    lists: usize,
}

impl MemoryLayout {
    /// Create a layout if the geometry is sane.
    pub fn new(
        base: PageAddr,
        page_size: u32,
        pages: usize,
        lists: usize,
    ) -> Result<Self, ConfigError> {
        if !valid_chunk_size(page_size) {
            return Err(ConfigError::InvalidField {
                field: "page_size",
                reason: "must be a power of two in 512..=65536",
            });
        }
        if base.0 % u64::from(page_size) != 0 {
            return Err(ConfigError::InvalidField {
                field: "base",
                reason: "must be page-aligned",
            });
        }
        if pages == 0 {
            return Err(ConfigError::InvalidField {
                field: "pages",
                reason: "must be at least 1",
            });
        }
        if lists == 0 || lists > pages {
            return Err(ConfigError::InvalidField {
                field: "lists",
                reason: "must be in 1..=pages",
            });
        }
        let span = u64::try_from(pages)
            .ok()
            .and_then(|p| p.checked_mul(u64::from(page_size)))
            .and_then(|bytes| base.0.checked_add(bytes));
        if span.is_none() {
            return Err(ConfigError::InvalidField {
                field: "pages",
                reason: "range end overflows the address space",
            });
        }
        Ok(Self {
            base,
            page_size,
            pages,
            lists,
        })
    }

    /// The layout the kernel ships with: 128 MiB of usable memory above
    /// the kernel load address, split over [`FREE_LIST_COUNT`] lists.
    #[must_use]
    pub fn kernel_default() -> Self {
        Self {
            base: PageAddr(0x8000_0000),
            page_size: PAGE_SIZE,
            pages: 32 * 1024,
            lists: FREE_LIST_COUNT,
        }
    }

    #[must_use]
    pub fn base(self) -> PageAddr {
        self.base
    }

    #[must_use]
    pub fn page_size(self) -> u32 {
        self.page_size
    }

    #[must_use]
    pub fn pages(self) -> usize {
        self.pages
    }

    #[must_use]
    pub fn lists(self) -> usize {
        self.lists
    }

    /// First address past the managed range.
    #[must_use]
    pub fn end(self) -> PageAddr {
        // Validated against overflow in `new`.
        PageAddr(self.base.0 + self.byte_len())
    }

    /// Managed range length in bytes.
    #[must_use]
    pub fn byte_len(self) -> u64 {
        u64::try_from(self.pages).expect("pages fits in u64") * u64::from(self.page_size)
    }

    /// Address of the page at `index`.
    ///
    /// # Panics
    /// Panics if `index` is out of range; indices come from the
    /// allocator's own bookkeeping, so that is a bug, not an input error.
    #[must_use]
    pub fn addr_of(self, index: usize) -> PageAddr {
        assert!(index < self.pages, "page index {index} out of range");
        let offset = u64::try_from(index).expect("index fits in u64") * u64::from(self.page_size);
        PageAddr(self.base.0 + offset)
    }

    /// Page index of `addr`, or `None` if the address is misaligned or
    /// outside the managed range.
    #[must_use]
    pub fn index_of(self, addr: PageAddr) -> Option<usize> {
        let offset = addr.0.checked_sub(self.base.0)?;
        if offset % u64::from(self.page_size) != 0 {
            return None;
        }
        let index = usize::try_from(offset / u64::from(self.page_size)).ok()?;
        (index < self.pages).then_some(index)
    }

    /// Pages in each list's equal-quota sub-range.
    #[must_use]
    pub fn pages_per_list(self) -> usize {
        self.pages / self.lists
    }

    /// The page-index range of `list`'s contiguous quota.
    ///
    /// Remainder pages beyond `lists * pages_per_list()` are not part of
    /// any quota range; see [`Self::remainder_range`].
    #[must_use]
    pub fn quota_range(self, list: usize) -> std::ops::Range<usize> {
        assert!(list < self.lists, "list index {list} out of range");
        let quota = self.pages_per_list();
        list * quota..(list + 1) * quota
    }

    /// The page-index range of the leftover pages seeded onto list 0.
    #[must_use]
    pub fn remainder_range(self) -> std::ops::Range<usize> {
        self.lists * self.pages_per_list()..self.pages
    }

    /// The list a page index is seeded onto at startup.
    #[must_use]
    pub fn seeded_list_of(self, index: usize) -> usize {
        assert!(index < self.pages, "page index {index} out of range");
        let quota = self.pages_per_list();
        let list = index / quota;
        if list < self.lists { list } else { 0 }
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
