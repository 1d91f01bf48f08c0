use std::{
    cell::UnsafeCell,
    hash::{BuildHasher, Hash, Hasher},
    ptr,
    sync::atomic::{AtomicPtr, Ordering},
};

use parking_lot::RwLock;

/// The segment table holds one slot per bit of `usize`, which is enough to
/// address every power-of-two bucket count the map can grow to.
pub(crate) const SEGMENT_TABLE_LEN: usize = usize::BITS as usize;

pub(crate) const INITIAL_BUCKET_COUNT: usize = 8;

/// An entry node. It exclusively owns its key-value pair; the `next` pointer
/// links it into a bucket list.
///
/// Once a node has been published into a bucket list, `next` is mutated only
/// while the bucket's exclusive lock is held (the removal and rehash paths),
/// so readers that reached the node through an acquire load of the head see
/// a stable suffix.
pub(crate) struct Node<K, V> {
    next: AtomicPtr<Node<K, V>>,
    key: K,
    mapped: UnsafeCell<V>,
}

impl<K, V> Node<K, V> {
    pub(crate) fn new(key: K, mapped: V) -> Self {
        Self {
            next: AtomicPtr::new(ptr::null_mut()),
            key,
            mapped: UnsafeCell::new(mapped),
        }
    }

    pub(crate) fn key(&self) -> &K {
        &self.key
    }

    /// # Safety
    ///
    /// The caller must hold at least the shared lock of the bucket that owns
    /// this node.
    pub(crate) unsafe fn mapped(&self) -> &V {
        &*self.mapped.get()
    }

    /// # Safety
    ///
    /// The caller must hold the exclusive lock of the bucket that owns this
    /// node.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn mapped_mut(&self) -> &mut V {
        &mut *self.mapped.get()
    }

    pub(crate) fn next(&self) -> *mut Node<K, V> {
        self.next.load(Ordering::Acquire)
    }

    pub(crate) fn set_next(&self, next: *mut Node<K, V>) {
        self.next.store(next, Ordering::Release);
    }
}

/// A bucket: a shared/exclusive lock plus an atomic head pointer to a singly
/// linked list of nodes.
///
/// The lock does not guard the head pointer itself. Insertion CASes a new
/// node onto the head under either lock flavor; unlinking uses plain stores
/// and is legal only under the exclusive lock.
pub(crate) struct Bucket<K, V> {
    lock: RwLock<()>,
    head: AtomicPtr<Node<K, V>>,
}

impl<K, V> Bucket<K, V> {
    pub(crate) fn new() -> Self {
        Self {
            lock: RwLock::new(()),
            head: AtomicPtr::new(ptr::null_mut()),
        }
    }

    pub(crate) fn lock(&self) -> &RwLock<()> {
        &self.lock
    }

    pub(crate) fn head(&self) -> *mut Node<K, V> {
        self.head.load(Ordering::Acquire)
    }

    pub(crate) fn store_head(&self, node: *mut Node<K, V>) {
        self.head.store(node, Ordering::Release);
    }

    /// Links `new_node` in front of `expected_head` and tries to publish it.
    ///
    /// The expected head must be passed in by the caller because the actual
    /// head may have moved between its search and this call; on failure the
    /// caller re-scans the fresh prefix and retries.
    pub(crate) fn try_insert(&self, expected_head: *mut Node<K, V>, new_node: *mut Node<K, V>) -> bool {
        unsafe { (*new_node).set_next(expected_head) };
        self.head
            .compare_exchange(
                expected_head,
                new_node,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }
}

/// Returns the index of the segment holding the bucket with `bucket_index`.
pub(crate) fn segment_index(bucket_index: usize) -> usize {
    (bucket_index | 1).ilog2() as usize
}

/// Returns the global index of the first bucket stored in the segment.
pub(crate) fn segment_first_bucket(segment_index: usize) -> usize {
    (1usize << segment_index) & !1
}

/// Returns the number of buckets stored in the segment. Segment 0 holds
/// buckets 0 and 1.
pub(crate) fn segment_len(segment_index: usize) -> usize {
    if segment_index == 0 {
        2
    } else {
        1 << segment_index
    }
}

pub(crate) fn hash_key<S, Q>(build_hasher: &S, key: &Q) -> u64
where
    S: BuildHasher,
    Q: Hash + ?Sized,
{
    let mut hasher = build_hasher.build_hasher();
    key.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segment_math_covers_the_bucket_space() {
        assert_eq!(segment_index(0), 0);
        assert_eq!(segment_index(1), 0);
        assert_eq!(segment_index(2), 1);
        assert_eq!(segment_index(3), 1);
        assert_eq!(segment_index(4), 2);
        assert_eq!(segment_index(7), 2);
        assert_eq!(segment_index(8), 3);

        assert_eq!(segment_first_bucket(0), 0);
        assert_eq!(segment_first_bucket(1), 2);
        assert_eq!(segment_first_bucket(2), 4);
        assert_eq!(segment_first_bucket(3), 8);

        assert_eq!(segment_len(0), 2);
        assert_eq!(segment_len(1), 2);
        assert_eq!(segment_len(2), 4);
        assert_eq!(segment_len(3), 8);
    }

    #[test]
    fn every_bucket_maps_into_its_segment() {
        for bucket_index in 0..4096usize {
            let segment = segment_index(bucket_index);
            let first = segment_first_bucket(segment);
            let len = segment_len(segment);
            assert!(bucket_index >= first);
            assert!(bucket_index < first + len, "bucket {bucket_index}");
        }
    }
}
