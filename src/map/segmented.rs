use std::{
    borrow::Borrow,
    hash::{BuildHasher, Hash},
    ptr::{self, NonNull},
    sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering},
};

use parking_lot::{RwLockReadGuard, RwLockWriteGuard};

use super::{
    accessor::{BucketGuard, ExclusiveAccessor, SharedAccessor},
    bucket::{self, Bucket, Node, INITIAL_BUCKET_COUNT, SEGMENT_TABLE_LEN},
    DefaultHashBuilder,
};

/// A concurrent hash map with lock striping at bucket granularity.
///
/// Buckets live in a lazily grown segment table, so growing the map never
/// relocates existing buckets and a bucket reference stays valid for the
/// map's lifetime. Each bucket pairs a shared/exclusive lock with an atomic
/// head pointer to a singly linked list of entries:
///
/// - Lookups and emplacements run under the *shared* lock; emplacement
///   publishes its node with a head CAS, so emplacements of distinct keys in
///   the same bucket do not serialize with each other.
/// - Erasure runs under the *exclusive* lock and unlinks with plain stores.
/// - Rehashing doubles the bucket count under every bucket's exclusive
///   lock. It is triggered by a load-factor flag that every operation
///   inspects on entry; shrinking is not supported.
///
/// Operations that bind an entry return an accessor handle
/// ([`SharedAccessor`] or [`ExclusiveAccessor`]) which holds the bucket
/// lock until dropped.
pub struct SegmentedHashMap<K, V, S = DefaultHashBuilder> {
    segments: Box<[AtomicPtr<Bucket<K, V>>]>,
    build_hasher: S,
    bucket_count: AtomicUsize,
    len: AtomicUsize,
    rehash_required: AtomicBool,
}

unsafe impl<K, V, S> Send for SegmentedHashMap<K, V, S>
where
    K: Send,
    V: Send,
    S: Send,
{
}

unsafe impl<K, V, S> Sync for SegmentedHashMap<K, V, S>
where
    K: Send + Sync,
    V: Send + Sync,
    S: Sync,
{
}

impl<K, V> SegmentedHashMap<K, V, DefaultHashBuilder> {
    /// Creates an empty map with the default hasher.
    pub fn new() -> Self {
        Self::with_hasher(DefaultHashBuilder::default())
    }
}

impl<K, V> Default for SegmentedHashMap<K, V, DefaultHashBuilder> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V, S> SegmentedHashMap<K, V, S> {
    /// Creates an empty map that uses `build_hasher` to hash keys.
    pub fn with_hasher(build_hasher: S) -> Self {
        Self {
            segments: (0..SEGMENT_TABLE_LEN)
                .map(|_| AtomicPtr::new(ptr::null_mut()))
                .collect(),
            build_hasher,
            bucket_count: AtomicUsize::new(INITIAL_BUCKET_COUNT),
            len: AtomicUsize::new(0),
            rehash_required: AtomicBool::new(false),
        }
    }

    /// Returns the number of entries in the map.
    ///
    /// The counter is maintained with relaxed atomics; it may briefly
    /// disagree with the observable entry set while inserts and erasures
    /// are in flight.
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[cfg(test)]
    pub(crate) fn bucket_count(&self) -> usize {
        self.bucket_count.load(Ordering::Relaxed)
    }

    /// Returns the bucket with the given global index, creating its segment
    /// on first touch.
    fn bucket_at(&self, bucket_index: usize) -> &Bucket<K, V> {
        let segment = bucket::segment_index(bucket_index);
        let base = self.ensure_segment(segment);
        let offset = bucket_index - bucket::segment_first_bucket(segment);
        unsafe { &*base.add(offset) }
    }

    fn ensure_segment(&self, segment: usize) -> *mut Bucket<K, V> {
        let slot = &self.segments[segment];
        let existing = slot.load(Ordering::Acquire);
        if !existing.is_null() {
            return existing;
        }

        let len = bucket::segment_len(segment);
        let mut buckets: Vec<Bucket<K, V>> = Vec::with_capacity(len);
        buckets.resize_with(len, Bucket::new);
        let raw = Box::into_raw(buckets.into_boxed_slice()) as *mut Bucket<K, V>;

        match slot.compare_exchange(ptr::null_mut(), raw, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => raw,
            Err(winner) => {
                // Another thread published this segment first.
                drop(unsafe { Box::from_raw(ptr::slice_from_raw_parts_mut(raw, len)) });
                winner
            }
        }
    }
}

impl<K, V, S> SegmentedHashMap<K, V, S>
where
    K: Hash + Eq,
    S: BuildHasher,
{
    /// Inserts a `(key, value)` entry, binding a shared accessor to it.
    ///
    /// Returns `true` if the entry was inserted. If an entry with an equal
    /// key already exists (or a concurrent emplace wins the publication
    /// race), the given pair is discarded, the accessor is bound to the
    /// existing entry and `false` is returned. Among any number of
    /// concurrent emplaces of equal keys, exactly one returns `true`.
    pub fn emplace(&self, key: K, value: V) -> (SharedAccessor<'_, K, V>, bool) {
        let (guard, _bucket, node, inserted) =
            self.emplace_with::<RwLockReadGuard<'_, ()>>(key, value);
        (SharedAccessor { _guard: guard, node }, inserted)
    }

    /// Like [`emplace`][Self::emplace], but binds an exclusive accessor.
    pub fn emplace_exclusive(&self, key: K, value: V) -> (ExclusiveAccessor<'_, K, V>, bool) {
        let (guard, bucket, node, inserted) =
            self.emplace_with::<RwLockWriteGuard<'_, ()>>(key, value);
        (
            ExclusiveAccessor {
                guard,
                bucket,
                node,
            },
            inserted,
        )
    }

    /// Binds a shared accessor to the entry with an equal key, if present.
    ///
    /// The key may be any borrowed form of the map's key type, but `Hash`
    /// and `Eq` on the borrowed form must match those for the key type.
    pub fn find<Q>(&self, key: &Q) -> Option<SharedAccessor<'_, K, V>>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.find_with::<RwLockReadGuard<'_, ()>, Q>(key)
            .map(|(guard, _bucket, node)| SharedAccessor { _guard: guard, node })
    }

    /// Binds an exclusive accessor to the entry with an equal key, if
    /// present.
    pub fn find_exclusive<Q>(&self, key: &Q) -> Option<ExclusiveAccessor<'_, K, V>>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.find_with::<RwLockWriteGuard<'_, ()>, Q>(key)
            .map(|(guard, bucket, node)| ExclusiveAccessor {
                guard,
                bucket,
                node,
            })
    }

    /// Removes the entry with an equal key. Returns whether an entry was
    /// removed.
    pub fn erase<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.rehash_if_necessary();

        let hash = bucket::hash_key(&self.build_hasher, key);
        let (guard, bucket) = self.lock_bucket::<RwLockWriteGuard<'_, ()>>(hash);

        // The exclusive lock is held: no other writer is in the list and
        // readers re-acquire the head through the atomic.
        let removed = unsafe { Self::unlink(bucket, |node| node.key().borrow() == key) };
        drop(guard);

        match removed {
            Some(node) => {
                drop(unsafe { Box::from_raw(node.as_ptr()) });
                self.len.fetch_sub(1, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    /// Removes the entry bound to the accessor, consuming the handle.
    ///
    /// The accessor must have been produced by this map; binding it to a
    /// different map is a logic error diagnosed only in debug builds.
    pub fn erase_entry(&self, accessor: ExclusiveAccessor<'_, K, V>) {
        let ExclusiveAccessor {
            guard,
            bucket,
            node,
        } = accessor;
        let target = node.as_ptr();

        let removed = unsafe { Self::unlink(bucket, |n| ptr::eq(n, target.cast_const())) };
        debug_assert!(removed.is_some());
        drop(guard);

        if removed.is_some() {
            drop(unsafe { Box::from_raw(target) });
            self.len.fetch_sub(1, Ordering::Relaxed);
        }
    }

    /// Visits every entry in the map.
    ///
    /// Iteration takes no locks; the `&mut self` receiver is what
    /// guarantees no concurrent modification.
    pub fn for_each(&mut self, mut f: impl FnMut(&K, &V)) {
        for segment in 0..SEGMENT_TABLE_LEN {
            let base = *self.segments[segment].get_mut();
            if base.is_null() {
                continue;
            }
            for offset in 0..bucket::segment_len(segment) {
                let bucket = unsafe { &*base.add(offset) };
                let mut current = bucket.head();
                while !current.is_null() {
                    let node = unsafe { &*current };
                    f(node.key(), unsafe { node.mapped() });
                    current = node.next();
                }
            }
        }
    }

    fn emplace_with<'a, G>(&'a self, key: K, value: V) -> (G, &'a Bucket<K, V>, NonNull<Node<K, V>>, bool)
    where
        G: BucketGuard<'a>,
    {
        self.rehash_if_necessary();

        let hash = bucket::hash_key(&self.build_hasher, &key);
        let new_node = Box::into_raw(Box::new(Node::new(key, value)));
        let node_ref = unsafe { &*new_node };

        let (guard, bucket) = self.lock_bucket::<G>(hash);

        let (mut found, mut head) = Self::search_from(bucket, node_ref.key(), ptr::null_mut());
        if found.is_none() {
            loop {
                if bucket.try_insert(head, new_node) {
                    break;
                }
                // Lost the publication race. A concurrent emplace may have
                // inserted an equal key; re-scan the fresh prefix only,
                // using the previous head as the stop marker.
                let (racing, new_head) = Self::search_from(bucket, node_ref.key(), head);
                found = racing;
                head = new_head;
                if found.is_some() {
                    break;
                }
            }
        }

        if let Some(existing) = found {
            drop(unsafe { Box::from_raw(new_node) });
            return (guard, bucket, existing, false);
        }

        let size = self.len.fetch_add(1, Ordering::Relaxed) + 1;
        self.mark_rehash_required_if_necessary(size);

        (guard, bucket, unsafe { NonNull::new_unchecked(new_node) }, true)
    }

    fn find_with<'a, G, Q>(&'a self, key: &Q) -> Option<(G, &'a Bucket<K, V>, NonNull<Node<K, V>>)>
    where
        G: BucketGuard<'a>,
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.rehash_if_necessary();

        let hash = bucket::hash_key(&self.build_hasher, key);
        let (guard, bucket) = self.lock_bucket::<G>(hash);

        let (found, _head) = Self::search_from(bucket, key, ptr::null_mut());
        found.map(|node| (guard, bucket, node))
    }

    /// Maps `hash` to its bucket and acquires the bucket's lock, guarding
    /// against a rehash racing with the acquisition.
    ///
    /// After the lock is taken the bucket count is re-read; if it changed
    /// *and* remapping sends the hash to a different bucket, the lock is
    /// released and the mapping step retried. Otherwise the held lock is
    /// valid even though a rehash completed meanwhile.
    fn lock_bucket<'a, G>(&'a self, hash: u64) -> (G, &'a Bucket<K, V>)
    where
        G: BucketGuard<'a>,
    {
        let mut bucket_count = self.bucket_count.load(Ordering::Relaxed);
        loop {
            let index = (hash % bucket_count as u64) as usize;
            let bucket = self.bucket_at(index);
            let guard = G::acquire(bucket.lock());

            let current = self.bucket_count.load(Ordering::Relaxed);
            if current == bucket_count || (hash % current as u64) as usize == index {
                return (guard, bucket);
            }

            bucket_count = current;
            drop(guard);
        }
    }

    /// Scans the bucket list from the current head down to `stop` for an
    /// equal key.
    ///
    /// Returns the matching node, if any, and the head observed at scan
    /// start, which the caller passes back as the next stop marker to avoid
    /// re-traversing an already searched suffix.
    fn search_from<Q>(
        bucket: &Bucket<K, V>,
        key: &Q,
        stop: *mut Node<K, V>,
    ) -> (Option<NonNull<Node<K, V>>>, *mut Node<K, V>)
    where
        K: Borrow<Q>,
        Q: Eq + ?Sized,
    {
        let head = bucket.head();
        let mut current = head;
        while current != stop {
            let node = unsafe { &*current };
            if node.key().borrow() == key {
                return (NonNull::new(current), head);
            }
            current = node.next();
        }
        (None, head)
    }

    /// Unlinks the first node satisfying `matches` from the bucket list.
    ///
    /// # Safety
    ///
    /// The caller must hold the bucket's exclusive lock.
    unsafe fn unlink(
        bucket: &Bucket<K, V>,
        mut matches: impl FnMut(&Node<K, V>) -> bool,
    ) -> Option<NonNull<Node<K, V>>> {
        let mut prev: *mut Node<K, V> = ptr::null_mut();
        let mut current = bucket.head();
        while !current.is_null() {
            let node = &*current;
            if matches(node) {
                let next = node.next();
                if prev.is_null() {
                    bucket.store_head(next);
                } else {
                    (*prev).set_next(next);
                }
                return NonNull::new(current);
            }
            prev = current;
            current = node.next();
        }
        None
    }

    fn mark_rehash_required_if_necessary(&self, size: usize) {
        // Load factor above 1.0; `size` is a hint, the authoritative check
        // happens under the lock-all gate.
        if size > self.bucket_count.load(Ordering::Relaxed) {
            self.rehash_required.store(true, Ordering::Release);
        }
    }

    fn rehash_if_necessary(&self) {
        if !self.rehash_required.load(Ordering::Acquire) {
            return;
        }

        let current = self.bucket_count.load(Ordering::Relaxed);
        let mut guards = Vec::with_capacity(current);
        for index in 0..current {
            guards.push(self.bucket_at(index).lock().write());
        }

        // Every bucket is locked; re-check now that no operation can be in
        // flight. A competing rehash may have finished while the locks were
        // being collected.
        if self.rehash_required.load(Ordering::Acquire)
            && self.bucket_count.load(Ordering::Relaxed) == current
        {
            if self.len.load(Ordering::Relaxed) > current {
                self.rehash(current);
            }
            self.rehash_required.store(false, Ordering::Release);
        }
    }

    /// Doubles the bucket count and redistributes every entry.
    ///
    /// Requires every bucket in `0..current_bucket_count` to be exclusively
    /// locked by the calling thread.
    fn rehash(&self, current_bucket_count: usize) {
        let new_bucket_count = current_bucket_count * 2;

        let mut detached = Vec::with_capacity(current_bucket_count);
        for index in 0..current_bucket_count {
            let bucket = self.bucket_at(index);
            detached.push(bucket.head());
            bucket.store_head(ptr::null_mut());
        }

        for mut node_ptr in detached {
            while !node_ptr.is_null() {
                let node = unsafe { &*node_ptr };
                let next = node.next();

                let hash = bucket::hash_key(&self.build_hasher, node.key());
                let new_bucket = self.bucket_at((hash % new_bucket_count as u64) as usize);
                let inserted = new_bucket.try_insert(new_bucket.head(), node_ptr);
                debug_assert!(inserted);

                node_ptr = next;
            }
        }

        self.bucket_count.store(new_bucket_count, Ordering::Release);
    }
}

impl<K, V, S> Drop for SegmentedHashMap<K, V, S> {
    fn drop(&mut self) {
        for segment in 0..SEGMENT_TABLE_LEN {
            let base = *self.segments[segment].get_mut();
            if base.is_null() {
                continue;
            }
            let len = bucket::segment_len(segment);
            for offset in 0..len {
                let bucket = unsafe { &*base.add(offset) };
                let mut current = bucket.head();
                while !current.is_null() {
                    let node = unsafe { Box::from_raw(current) };
                    current = node.next();
                }
            }
            drop(unsafe { Box::from_raw(ptr::slice_from_raw_parts_mut(base, len)) });
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::SegmentedHashMap;

    #[test]
    fn emplace_then_find() {
        let map = SegmentedHashMap::new();

        let (accessor, inserted) = map.emplace(1, 100);
        assert!(inserted);
        assert_eq!(*accessor.key(), 1);
        assert_eq!(*accessor.mapped(), 100);
        drop(accessor);

        let accessor = map.find(&1).expect("key 1 should be present");
        assert_eq!(*accessor.mapped(), 100);
        drop(accessor);

        assert!(map.find(&2).is_none());
        assert_eq!(map.len(), 1);
        assert!(!map.is_empty());
    }

    #[test]
    fn emplace_duplicate_binds_existing() {
        let map = SegmentedHashMap::new();

        let (first, inserted) = map.emplace(7, 70);
        assert!(inserted);
        drop(first);

        let (second, inserted) = map.emplace(7, 7000);
        assert!(!inserted);
        assert_eq!(*second.mapped(), 70, "the first emplace wins");
        drop(second);

        assert_eq!(map.len(), 1);
    }

    #[test]
    fn emplace_exclusive_binds_for_mutation() {
        let map = SegmentedHashMap::new();

        let (mut accessor, inserted) = map.emplace_exclusive(9, 90);
        assert!(inserted);
        *accessor.mapped_mut() += 1;
        assert_eq!(*accessor.mapped(), 91);
        drop(accessor);

        let (mut accessor, inserted) = map.emplace_exclusive(9, 0);
        assert!(!inserted);
        assert_eq!(*accessor.key(), 9);
        *accessor.mapped_mut() += 1;
        drop(accessor);

        assert_eq!(*map.find(&9).unwrap().mapped(), 92);
    }

    #[test]
    fn exclusive_accessor_mutates_mapped() {
        let map = SegmentedHashMap::new();
        drop(map.emplace(1, String::from("one")));

        let mut accessor = map.find_exclusive(&1).unwrap();
        accessor.mapped_mut().push_str(" hundred");
        drop(accessor);

        let accessor = map.find(&1).unwrap();
        assert_eq!(accessor.mapped(), "one hundred");
    }

    #[test]
    fn shared_accessor_admits_interior_mutability() {
        let map = SegmentedHashMap::new();
        drop(map.emplace(1, AtomicUsize::new(0)));

        let a = map.find(&1).unwrap();
        let b = map.find(&1).unwrap();
        a.mapped().fetch_add(2, Ordering::Relaxed);
        b.mapped().fetch_add(3, Ordering::Relaxed);
        drop(a);
        drop(b);

        let accessor = map.find(&1).unwrap();
        assert_eq!(accessor.mapped().load(Ordering::Relaxed), 5);
    }

    #[test]
    fn erase_is_idempotent() {
        let map = SegmentedHashMap::new();
        drop(map.emplace(3, 300));

        assert!(map.erase(&3));
        assert!(!map.erase(&3));
        assert!(map.find(&3).is_none());
        assert_eq!(map.len(), 0);
    }

    #[test]
    fn erase_through_accessor_unbinds() {
        let map = SegmentedHashMap::new();
        drop(map.emplace(4, 400));
        drop(map.emplace(5, 500));

        let accessor = map.find_exclusive(&4).unwrap();
        map.erase_entry(accessor);

        assert!(map.find(&4).is_none());
        assert_eq!(*map.find(&5).unwrap().mapped(), 500);
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn borrowed_key_lookup() {
        let map: SegmentedHashMap<String, usize> = SegmentedHashMap::new();
        drop(map.emplace("alpha".to_owned(), 1));

        assert_eq!(*map.find("alpha").unwrap().mapped(), 1);
        assert!(map.erase("alpha"));
        assert!(map.find("alpha").is_none());
    }

    #[test]
    fn rehash_preserves_every_entry() {
        let map = SegmentedHashMap::new();
        let initial_buckets = map.bucket_count();

        for key in 0..1000 {
            let (_, inserted) = map.emplace(key, key * 10);
            assert!(inserted);
        }
        // Trigger the deferred rehash from a read path as well.
        assert!(map.find(&0).is_some());

        assert!(map.bucket_count() > initial_buckets);
        assert_eq!(map.len(), 1000);
        for key in 0..1000 {
            let accessor = map.find(&key).unwrap_or_else(|| panic!("key {key} lost"));
            assert_eq!(*accessor.mapped(), key * 10);
        }
    }

    #[test]
    fn for_each_visits_every_entry() {
        let mut map = SegmentedHashMap::new();
        for key in 0..100 {
            drop(map.emplace(key, key + 1));
        }

        let mut visited = vec![false; 100];
        map.for_each(|key, value| {
            assert_eq!(*value, *key + 1);
            assert!(!visited[*key], "entry visited twice");
            visited[*key] = true;
        });
        assert!(visited.into_iter().all(|seen| seen));
    }

    #[test]
    fn concurrent_emplace_distinct_keys() {
        const THREADS: usize = 8;
        const PER_THREAD: usize = 1000;

        let map = SegmentedHashMap::new();

        std::thread::scope(|s| {
            for t in 0..THREADS {
                let map = &map;
                s.spawn(move || {
                    for i in 0..PER_THREAD {
                        let key = t * PER_THREAD + i;
                        let (_, inserted) = map.emplace(key, key);
                        assert!(inserted);
                    }
                });
            }
        });

        assert_eq!(map.len(), THREADS * PER_THREAD);
        for key in 0..THREADS * PER_THREAD {
            assert_eq!(*map.find(&key).unwrap().mapped(), key);
        }
    }

    #[test]
    fn concurrent_emplace_equal_keys_has_one_winner() {
        const THREADS: usize = 8;
        const KEYS: usize = 512;

        let map = SegmentedHashMap::new();
        let wins = AtomicUsize::new(0);

        std::thread::scope(|s| {
            for t in 0..THREADS {
                let map = &map;
                let wins = &wins;
                s.spawn(move || {
                    for key in 0..KEYS {
                        let (accessor, inserted) = map.emplace(key, t);
                        if inserted {
                            wins.fetch_add(1, Ordering::Relaxed);
                        } else {
                            // The loser is bound to the winning entry.
                            assert!(*accessor.mapped() < THREADS);
                        }
                    }
                });
            }
        });

        assert_eq!(wins.load(Ordering::Relaxed), KEYS);
        assert_eq!(map.len(), KEYS);
    }

    #[test]
    fn concurrent_erase_and_emplace() {
        const KEYS: usize = 1000;

        let map = SegmentedHashMap::new();
        for key in 0..KEYS {
            drop(map.emplace(key, key));
        }

        let erased = AtomicUsize::new(0);
        std::thread::scope(|s| {
            let map = &map;
            let erased = &erased;
            s.spawn(move || {
                for key in 0..KEYS {
                    if map.erase(&key) {
                        erased.fetch_add(1, Ordering::Relaxed);
                    }
                }
            });
            s.spawn(move || {
                for key in KEYS..KEYS * 2 {
                    drop(map.emplace(key, key));
                }
            });
        });

        assert_eq!(erased.load(Ordering::Relaxed), KEYS);
        assert_eq!(map.len(), KEYS);
        for key in KEYS..KEYS * 2 {
            assert!(map.find(&key).is_some());
        }
    }
}
