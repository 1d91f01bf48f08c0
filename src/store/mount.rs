use std::{
    ptr,
    sync::atomic::{AtomicPtr, Ordering},
};

use crossbeam_utils::Backoff;

/// One mount binding: which tom serves the mount id, at which sub-path
/// inside the tom, and at which read priority.
///
/// Records are immutable after publication into a [`MountSet`].
struct MountRecord {
    tom_id: String,
    path: String,
    priority: usize,
    next: AtomicPtr<MountRecord>,
}

/// An owned copy of one mount record, taken while enumerating a
/// [`MountSet`].
#[derive(Debug, Clone)]
pub(crate) struct MountPoint {
    pub(crate) tom_id: String,
    pub(crate) path: String,
    pub(crate) priority: usize,
}

/// The set of mount records bound to one mount id: a lock-free singly
/// linked stack reachable from an atomic head.
///
/// Publication CASes a new record onto the head, so pushing needs only a
/// shared hold on the map entry that owns the set. Records are freed in a
/// batch when the set drops, which happens under the owning bucket's
/// exclusive lock (unmount); enumeration always happens under at least the
/// shared lock, so it never races the batch free.
pub(crate) struct MountSet {
    head: AtomicPtr<MountRecord>,
}

impl MountSet {
    pub(crate) fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Publishes a new record at the head of the stack.
    pub(crate) fn push(&self, tom_id: &str, path: &str, priority: usize) {
        let record = Box::into_raw(Box::new(MountRecord {
            tom_id: tom_id.to_owned(),
            path: path.to_owned(),
            priority,
            next: AtomicPtr::new(ptr::null_mut()),
        }));

        let backoff = Backoff::new();
        let mut head = self.head.load(Ordering::Acquire);
        loop {
            unsafe { (*record).next.store(head, Ordering::Relaxed) };
            match self
                .head
                .compare_exchange_weak(head, record, Ordering::Release, Ordering::Acquire)
            {
                Ok(_) => return,
                Err(current) => {
                    head = current;
                    backoff.spin();
                }
            }
        }
    }

    /// Copies the records reachable from the head, in list order.
    ///
    /// The copy is what storage operations iterate after releasing the
    /// mount-table lock, so an unmount racing with an in-flight operation
    /// cannot invalidate the operation's view.
    pub(crate) fn snapshot(&self) -> Vec<MountPoint> {
        let mut points = Vec::new();
        let mut current = self.head.load(Ordering::Acquire);
        while !current.is_null() {
            let record = unsafe { &*current };
            points.push(MountPoint {
                tom_id: record.tom_id.clone(),
                path: record.path.clone(),
                priority: record.priority,
            });
            current = record.next.load(Ordering::Acquire);
        }
        points
    }
}

impl Drop for MountSet {
    fn drop(&mut self) {
        let mut current = *self.head.get_mut();
        while !current.is_null() {
            let record = unsafe { Box::from_raw(current) };
            current = record.next.load(Ordering::Relaxed);
        }
    }
}

unsafe impl Send for MountSet {}
unsafe impl Sync for MountSet {}
