use std::ptr::NonNull;

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::bucket::{Bucket, Node};

/// A bucket lock guard flavor chosen by the caller of a map operation.
///
/// Sealed: the only two flavors are the shared and the exclusive
/// `parking_lot` guards.
pub(crate) trait BucketGuard<'a>: sealed::Sealed + Sized {
    fn acquire(lock: &'a RwLock<()>) -> Self;
}

impl<'a> BucketGuard<'a> for RwLockReadGuard<'a, ()> {
    fn acquire(lock: &'a RwLock<()>) -> Self {
        lock.read()
    }
}

impl<'a> BucketGuard<'a> for RwLockWriteGuard<'a, ()> {
    fn acquire(lock: &'a RwLock<()>) -> Self {
        lock.write()
    }
}

mod sealed {
    pub trait Sealed {}
    impl Sealed for parking_lot::RwLockReadGuard<'_, ()> {}
    impl Sealed for parking_lot::RwLockWriteGuard<'_, ()> {}
}

/// A handle to one map entry, held under the shared lock of the entry's
/// bucket.
///
/// While the handle is alive no exclusive operation (erasure, rehash) can
/// touch the bucket, so the key and mapped references it yields stay valid.
/// Dropping the handle releases the lock.
///
/// The handle yields the mapped value as `&V` only. Mutating through a
/// shared handle is therefore expressible exactly when `V` provides its own
/// internal synchronization (atomics or a lock), which is the opt-in the
/// caller makes by choosing such a type.
pub struct SharedAccessor<'a, K, V> {
    pub(in crate::map) _guard: RwLockReadGuard<'a, ()>,
    pub(in crate::map) node: NonNull<Node<K, V>>,
}

impl<K, V> SharedAccessor<'_, K, V> {
    /// Returns the key of the bound entry.
    pub fn key(&self) -> &K {
        unsafe { self.node.as_ref() }.key()
    }

    /// Returns the mapped value of the bound entry.
    pub fn mapped(&self) -> &V {
        // The shared bucket lock is held for as long as `self` is alive.
        unsafe { self.node.as_ref().mapped() }
    }
}

/// A handle to one map entry, held under the exclusive lock of the entry's
/// bucket.
///
/// The exclusive lock admits mutation of the mapped value and entry removal
/// (see [`SegmentedHashMap::erase_entry`][erase-entry]). Dropping the handle
/// releases the lock.
///
/// [erase-entry]: crate::SegmentedHashMap::erase_entry
pub struct ExclusiveAccessor<'a, K, V> {
    pub(in crate::map) guard: RwLockWriteGuard<'a, ()>,
    pub(in crate::map) bucket: &'a Bucket<K, V>,
    pub(in crate::map) node: NonNull<Node<K, V>>,
}

impl<K, V> ExclusiveAccessor<'_, K, V> {
    /// Returns the key of the bound entry.
    pub fn key(&self) -> &K {
        unsafe { self.node.as_ref() }.key()
    }

    /// Returns the mapped value of the bound entry.
    pub fn mapped(&self) -> &V {
        unsafe { self.node.as_ref().mapped() }
    }

    /// Returns the mapped value of the bound entry for mutation.
    pub fn mapped_mut(&mut self) -> &mut V {
        // The exclusive bucket lock is held for as long as `self` is alive.
        unsafe { self.node.as_ref().mapped_mut() }
    }
}
