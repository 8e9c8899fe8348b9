//! Reference-counted audio buffers.
//!
//! All audio on the fast path travels in [`MemBlock`]s: cheap-to-clone
//! handles to a single allocation. A block's payload is immutable once it is
//! shared; exclusive holders may write through [`MemBlock::data_mut`].

use std::cell::{Ref, RefCell, RefMut};
use std::rc::Rc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// How a block's payload is owned.
enum Storage {
    /// Allocated together with the block itself.
    Appended(Box<[u8]>),
    /// An existing heap allocation handed over by the producer.
    Dynamic(Vec<u8>),
    /// A view into caller-owned memory (e.g. a shared arena slab). Copied
    /// out into `Dynamic` storage when the region must be reclaimed while
    /// other holders remain.
    Fixed { region: Rc<[u8]>, offset: usize },
}

struct BlockInner {
    storage: RefCell<Storage>,
    length: usize,
    stats: Rc<MempoolStats>,
}

impl Drop for BlockInner {
    fn drop(&mut self) {
        self.stats.n_allocated.fetch_sub(1, Ordering::Relaxed);
        self.stats
            .allocated_bytes
            .fetch_sub(self.length, Ordering::Relaxed);
    }
}

/// A refcounted, immutable-after-publish audio buffer.
///
/// Cloning the handle shares the underlying allocation; the storage is
/// released when the last handle drops.
#[derive(Clone)]
pub struct MemBlock {
    inner: Rc<BlockInner>,
}

impl MemBlock {
    fn from_storage(storage: Storage, length: usize, stats: Rc<MempoolStats>) -> Self {
        stats.n_allocated.fetch_add(1, Ordering::Relaxed);
        stats.allocated_bytes.fetch_add(length, Ordering::Relaxed);
        stats.n_accumulated.fetch_add(1, Ordering::Relaxed);
        stats.accumulated_bytes.fetch_add(length, Ordering::Relaxed);

        Self {
            inner: Rc::new(BlockInner {
                storage: RefCell::new(storage),
                length,
                stats,
            }),
        }
    }

    /// The byte length of the block. Immutable for the block's lifetime.
    pub fn len(&self) -> usize {
        self.inner.length
    }

    /// Whether the block holds no bytes.
    pub fn is_empty(&self) -> bool {
        self.inner.length == 0
    }

    /// The number of handles sharing this block.
    pub fn refcount(&self) -> usize {
        Rc::strong_count(&self.inner)
    }

    /// Whether this handle is the only holder.
    pub fn is_exclusive(&self) -> bool {
        self.refcount() == 1
    }

    /// Read access to the payload.
    pub fn data(&self) -> Ref<'_, [u8]> {
        Ref::map(self.inner.storage.borrow(), |s| match s {
            Storage::Appended(b) => &b[..],
            Storage::Dynamic(v) => &v[..],
            Storage::Fixed { region, offset } => &region[*offset..*offset + self.inner.length],
        })
    }

    /// Write access to the payload. The caller must hold the only handle;
    /// writing a shared block would violate the publish contract.
    ///
    /// Fixed blocks are detached from their backing region on first write.
    pub fn data_mut(&self) -> RefMut<'_, [u8]> {
        debug_assert!(self.is_exclusive(), "write to a shared memblock");

        self.detach_fixed();
        RefMut::map(self.inner.storage.borrow_mut(), |s| match s {
            Storage::Appended(b) => &mut b[..],
            Storage::Dynamic(v) => &mut v[..],
            Storage::Fixed { .. } => unreachable!("fixed storage was just detached"),
        })
    }

    /// Releases a fixed block on behalf of the region's owner. If other
    /// holders remain, the payload is first copied out of the region so the
    /// region can be reused or unmapped safely.
    pub fn unref_fixed(self) {
        if !self.is_exclusive() {
            self.detach_fixed();
        }
    }

    fn detach_fixed(&self) {
        let mut storage = self.inner.storage.borrow_mut();
        if let Storage::Fixed { region, offset } = &*storage {
            let copy = region[*offset..*offset + self.inner.length].to_vec();
            *storage = Storage::Dynamic(copy);
        }
    }
}

impl std::fmt::Debug for MemBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemBlock")
            .field("length", &self.inner.length)
            .field("refcount", &self.refcount())
            .finish()
    }
}

/// Shared counters describing all blocks allocated through one pool.
#[derive(Default)]
pub struct MempoolStats {
    n_allocated: AtomicUsize,
    allocated_bytes: AtomicUsize,
    n_accumulated: AtomicUsize,
    accumulated_bytes: AtomicUsize,
}

/// A point-in-time copy of the pool counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MempoolSnapshot {
    /// Blocks currently alive.
    pub n_allocated: usize,
    /// Bytes in blocks currently alive.
    pub allocated_bytes: usize,
    /// Blocks ever allocated.
    pub n_accumulated: usize,
    /// Bytes ever allocated.
    pub accumulated_bytes: usize,
}

/// The block factory. Clones share the same statistics counters.
#[derive(Clone, Default)]
pub struct Mempool {
    stats: Rc<MempoolStats>,
}

impl Mempool {
    /// Creates a new pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates a zero-filled block of the given length.
    pub fn allocate(&self, length: usize) -> MemBlock {
        MemBlock::from_storage(
            Storage::Appended(vec![0; length].into_boxed_slice()),
            length,
            self.stats.clone(),
        )
    }

    /// Wraps an existing heap buffer without copying.
    pub fn adopt(&self, data: Vec<u8>) -> MemBlock {
        let length = data.len();
        MemBlock::from_storage(Storage::Dynamic(data), length, self.stats.clone())
    }

    /// Borrows a slice of a caller-owned region without copying. The region
    /// stays alive at least as long as the block references it; use
    /// [`MemBlock::unref_fixed`] to reclaim it early.
    pub fn wrap_region(&self, region: Rc<[u8]>, offset: usize, length: usize) -> MemBlock {
        assert!(offset + length <= region.len());
        MemBlock::from_storage(Storage::Fixed { region, offset }, length, self.stats.clone())
    }

    /// A snapshot of the pool counters, for the `Stat` command.
    pub fn snapshot(&self) -> MempoolSnapshot {
        MempoolSnapshot {
            n_allocated: self.stats.n_allocated.load(Ordering::Relaxed),
            allocated_bytes: self.stats.allocated_bytes.load(Ordering::Relaxed),
            n_accumulated: self.stats.n_accumulated.load(Ordering::Relaxed),
            accumulated_bytes: self.stats.accumulated_bytes.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for Mempool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let snap = self.snapshot();
        f.debug_struct("Mempool")
            .field("n_allocated", &snap.n_allocated)
            .field("allocated_bytes", &snap.allocated_bytes)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refcounting_releases_once() {
        let pool = Mempool::new();
        let block = pool.allocate(128);
        assert_eq!(pool.snapshot().n_allocated, 1);
        assert_eq!(pool.snapshot().allocated_bytes, 128);

        let second = block.clone();
        assert_eq!(block.refcount(), 2);
        drop(second);
        assert_eq!(block.refcount(), 1);
        assert_eq!(pool.snapshot().n_allocated, 1);

        drop(block);
        let snap = pool.snapshot();
        assert_eq!(snap.n_allocated, 0);
        assert_eq!(snap.allocated_bytes, 0);
        assert_eq!(snap.n_accumulated, 1);
        assert_eq!(snap.accumulated_bytes, 128);
    }

    #[test]
    fn adopt_takes_ownership() {
        let pool = Mempool::new();
        let block = pool.adopt(vec![1, 2, 3]);
        assert_eq!(&*block.data(), &[1, 2, 3]);
    }

    #[test]
    fn fixed_blocks_detach_when_shared() {
        let pool = Mempool::new();
        let region: Rc<[u8]> = vec![9; 64].into();

        let block = pool.wrap_region(region.clone(), 16, 8);
        let holder = block.clone();

        // The region owner lets go while `holder` is still alive; the data
        // must survive as a private copy.
        block.unref_fixed();
        assert_eq!(&*holder.data(), &[9; 8]);

        drop(region);
        assert_eq!(&*holder.data(), &[9; 8]);
    }

    #[test]
    fn exclusive_write() {
        let pool = Mempool::new();
        let block = pool.allocate(4);
        block.data_mut().copy_from_slice(&[1, 2, 3, 4]);
        assert_eq!(&*block.data(), &[1, 2, 3, 4]);
    }
}
