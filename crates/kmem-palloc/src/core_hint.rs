//! Execution-context hints for free-list affinity.
//!
//! The allocator picks a preferred free list from the identity of the
//! current execution context. In a kernel that is the core id, read
//! with migration disabled so the context cannot move between reading
//! the hint and using it. On a host, thread identity is the stand-in:
//! a thread's id never changes, so the hint is stable by construction.

use kmem_types::CoreId;
use std::hash::{DefaultHasher, Hash, Hasher};

/// Source of the current execution context's identity.
pub trait CoreHint: Send + Sync {
    /// Stable identifier of the current execution context. Two calls
    /// from the same context always agree.
    fn current_core(&self) -> CoreId;
}

/// Derive a stable core id from the current thread.
///
/// Thread ids are mixed (multiply by a large odd constant, XOR-fold)
/// so that sequentially spawned threads spread across lists instead of
/// clustering on low indices.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadCoreHint;

impl CoreHint for ThreadCoreHint {
    fn current_core(&self) -> CoreId {
        let mut hasher = DefaultHasher::new();
        std::thread::current().id().hash(&mut hasher);
        let mixed = hasher.finish().wrapping_mul(0x517c_c1b7_2722_0a95);
        #[expect(clippy::cast_possible_truncation)] // intentional 64→32 fold
        let folded = (mixed ^ (mixed >> 32)) as u32;
        CoreId(folded)
    }
}

/// Always report the same core. Useful for single-core configurations
/// and deterministic tests.
#[derive(Debug, Clone, Copy)]
pub struct FixedCoreHint(pub CoreId);

impl CoreHint for FixedCoreHint {
    fn current_core(&self) -> CoreId {
        self.0
    }
}
