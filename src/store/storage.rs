use std::{
    collections::HashMap,
    fmt::Display,
    hash::{BuildHasher, Hash},
    marker::PhantomData,
    str::FromStr,
    time::Duration,
};

use crate::{
    common::{
        error::{DocumentError, StorageError},
        time::Clock,
    },
    map::{DefaultHashBuilder, SegmentedHashMap},
};

use super::{
    document::TomTree,
    mount::{MountPoint, MountSet},
    resolver::resolve_mount,
    tom::TomCoordinator,
};

/// Identifies a mount point in the virtual namespace.
pub type MountId = String;

/// Identifies a tom; it is also the filesystem path of the tom's XML file.
pub type TomId = String;

const KEY_LEAF: &str = "key";
const MAPPED_LEAF: &str = "mapped";
const DATE_CREATED_LEAF: &str = "date_created";
const LIFETIME_LEAF: &str = "lifetime";
const DOCUMENT_ROOT: &str = "tom/root";

/// A concurrent key-value store over mountable, XML-backed documents.
///
/// External hierarchical documents ("toms") are attached at virtual mount
/// points; a single mount id may be bound to many (tom, sub-path, priority)
/// records, and every operation on a virtual path fans out over all of
/// them. Reads merge results across mounts by per-key priority; entries may
/// carry a lifetime after which they become invisible until overwritten.
///
/// Documents are materialized lazily, one mutation stream per tom, written
/// back when a burst of writers drains, and evicted from memory when no
/// operation needs them. All operations take `&self` and may be called from
/// any number of threads.
///
/// `K` and `V` are the key and mapped types stored in tom entries. Both
/// travel through the documents' textual leaves, hence the `Display` and
/// `FromStr` bounds.
pub struct Storage<K, V, S = DefaultHashBuilder> {
    mount_table: SegmentedHashMap<MountId, MountSet, S>,
    tom_table: SegmentedHashMap<TomId, TomCoordinator, S>,
    clock: Clock,
    value_types: PhantomData<fn() -> (K, V)>,
}

impl<K, V> Storage<K, V> {
    /// Creates an empty storage with no mounts.
    pub fn new() -> Self {
        Self::with_hasher(DefaultHashBuilder::default())
    }

    #[cfg(test)]
    pub(crate) fn with_clock(clock: Clock) -> Self {
        let mut storage = Self::new();
        storage.clock = clock;
        storage
    }
}

impl<K, V> Default for Storage<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V, S> Storage<K, V, S>
where
    S: BuildHasher + Clone,
{
    /// Creates an empty storage that uses `build_hasher` for both the mount
    /// and the tom table.
    pub fn with_hasher(build_hasher: S) -> Self {
        Self {
            mount_table: SegmentedHashMap::with_hasher(build_hasher.clone()),
            tom_table: SegmentedHashMap::with_hasher(build_hasher),
            clock: Clock::default(),
            value_types: PhantomData,
        }
    }
}

impl<K, V, S> Storage<K, V, S>
where
    K: Clone + Display + FromStr + Hash + Eq,
    V: Clone + Display + FromStr,
    S: BuildHasher,
{
    /// Binds `mount_id` to the subtree of `tom_id` rooted at `path`, with
    /// the default (lowest) priority.
    ///
    /// A mount id may be bound repeatedly; reads fan out over every
    /// binding.
    pub fn mount(&self, mount_id: &str, tom_id: &str, path: &str) {
        self.mount_with_priority(mount_id, tom_id, path, 0);
    }

    /// Binds `mount_id` to the subtree of `tom_id` rooted at `path` with an
    /// explicit read priority.
    pub fn mount_with_priority(&self, mount_id: &str, tom_id: &str, path: &str, priority: usize) {
        // The coordinator must exist before the binding becomes visible to
        // operations resolving this mount id.
        drop(
            self.tom_table
                .emplace(tom_id.to_owned(), TomCoordinator::new(tom_id.to_owned())),
        );

        let (accessor, _) = self.mount_table.emplace(mount_id.to_owned(), MountSet::new());
        accessor.mapped().push(tom_id, path, priority);
        log::debug!("mounted `{mount_id}` -> `{tom_id}`@`{path}` (priority {priority})");
    }

    /// Drops every binding of `mount_id`. Returns whether the mount id was
    /// bound at all.
    ///
    /// Operations already past path resolution complete against the
    /// bindings they observed.
    pub fn unmount(&self, mount_id: &str) -> bool {
        let unmounted = self.mount_table.erase(mount_id);
        if unmounted {
            log::debug!("unmounted `{mount_id}`");
        }
        unmounted
    }

    /// Returns the `(tom id, sub-path)` bindings of `mount_id` in list
    /// order, or an empty list for an unbound mount id.
    pub fn get_mounts(&self, mount_id: &str) -> Vec<(TomId, String)> {
        match self.mount_table.find(mount_id) {
            Some(accessor) => accessor
                .mapped()
                .snapshot()
                .into_iter()
                .map(|point| (point.tom_id, point.path))
                .collect(),
            None => Vec::new(),
        }
    }

    /// Reads the keys stored at `virtual_path` across all mounts, after
    /// priority merging.
    pub fn key(&self, virtual_path: &str) -> Result<Vec<K>, StorageError> {
        self.read_op(virtual_path, |entry| {
            entry.key.clone().map(|key| (key.clone(), key))
        })
    }

    /// Reads the mapped values stored at `virtual_path` across all mounts,
    /// after priority merging.
    pub fn mapped(&self, virtual_path: &str) -> Result<Vec<V>, StorageError> {
        self.read_op(virtual_path, |entry| match (&entry.key, &entry.mapped) {
            (Some(key), Some(mapped)) => Some((key.clone(), mapped.clone())),
            _ => None,
        })
    }

    /// Reads the `(key, mapped)` pairs stored at `virtual_path` across all
    /// mounts, after priority merging.
    pub fn value(&self, virtual_path: &str) -> Result<Vec<(K, V)>, StorageError> {
        self.read_op(virtual_path, |entry| match (&entry.key, &entry.mapped) {
            (Some(key), Some(mapped)) => Some((key.clone(), (key.clone(), mapped.clone()))),
            _ => None,
        })
    }

    /// Overwrites the key leaf of every live entry at `virtual_path`.
    /// Returns how many mounts were modified.
    pub fn set_key(&self, virtual_path: &str, key: &K) -> Result<usize, StorageError> {
        self.write_op(virtual_path, |tree, path, now| {
            update_entry::<K, V>(tree, path, now, false, |node, _| {
                node.set_leaf(KEY_LEAF, key);
                true
            })
        })
    }

    /// Overwrites the mapped leaf of every live entry at `virtual_path`.
    pub fn set_mapped(&self, virtual_path: &str, mapped: &V) -> Result<usize, StorageError> {
        self.write_op(virtual_path, |tree, path, now| {
            update_entry::<K, V>(tree, path, now, false, |node, _| {
                node.set_leaf(MAPPED_LEAF, mapped);
                true
            })
        })
    }

    /// Overwrites both leaves of every live entry at `virtual_path`.
    pub fn set_value(&self, virtual_path: &str, value: &(K, V)) -> Result<usize, StorageError> {
        self.write_op(virtual_path, |tree, path, now| {
            update_entry::<K, V>(tree, path, now, false, |node, _| {
                node.set_leaf(KEY_LEAF, &value.0);
                node.set_leaf(MAPPED_LEAF, &value.1);
                true
            })
        })
    }

    /// Like [`set_key`][Self::set_key], but also applies to outdated
    /// entries and refreshes their creation date, bringing them back to
    /// life for another lifetime.
    pub fn set_key_as_new(&self, virtual_path: &str, key: &K) -> Result<usize, StorageError> {
        self.write_op(virtual_path, |tree, path, now| {
            update_entry::<K, V>(tree, path, now, true, |node, _| {
                node.set_leaf(KEY_LEAF, key);
                true
            })
        })
    }

    /// Like [`set_mapped`][Self::set_mapped], but also applies to outdated
    /// entries and refreshes their creation date.
    pub fn set_mapped_as_new(&self, virtual_path: &str, mapped: &V) -> Result<usize, StorageError> {
        self.write_op(virtual_path, |tree, path, now| {
            update_entry::<K, V>(tree, path, now, true, |node, _| {
                node.set_leaf(MAPPED_LEAF, mapped);
                true
            })
        })
    }

    /// Like [`set_value`][Self::set_value], but also applies to outdated
    /// entries and refreshes their creation date.
    pub fn set_value_as_new(&self, virtual_path: &str, value: &(K, V)) -> Result<usize, StorageError> {
        self.write_op(virtual_path, |tree, path, now| {
            update_entry::<K, V>(tree, path, now, true, |node, _| {
                node.set_leaf(KEY_LEAF, &value.0);
                node.set_leaf(MAPPED_LEAF, &value.1);
                true
            })
        })
    }

    /// Replaces the key of every live entry at `virtual_path` with
    /// `f(current)`. Returns how many mounts were modified.
    pub fn modify_key(
        &self,
        virtual_path: &str,
        f: impl Fn(K) -> K,
    ) -> Result<usize, StorageError> {
        self.write_op(virtual_path, |tree, path, now| {
            update_entry::<K, V>(tree, path, now, false, |node, entry| {
                match entry.key.clone() {
                    Some(key) => {
                        node.set_leaf(KEY_LEAF, &f(key));
                        true
                    }
                    None => false,
                }
            })
        })
    }

    /// Replaces the mapped value of every live entry at `virtual_path` with
    /// `f(current)`. Entries without a mapped leaf are left alone.
    pub fn modify_mapped(
        &self,
        virtual_path: &str,
        f: impl Fn(V) -> V,
    ) -> Result<usize, StorageError> {
        self.write_op(virtual_path, |tree, path, now| {
            update_entry::<K, V>(tree, path, now, false, |node, entry| {
                match entry.mapped.clone() {
                    Some(mapped) => {
                        node.set_leaf(MAPPED_LEAF, &f(mapped));
                        true
                    }
                    None => false,
                }
            })
        })
    }

    /// Replaces the `(key, mapped)` pair of every live entry at
    /// `virtual_path` with `f(current)`.
    pub fn modify_value(
        &self,
        virtual_path: &str,
        f: impl Fn((K, V)) -> (K, V),
    ) -> Result<usize, StorageError> {
        self.write_op(virtual_path, |tree, path, now| {
            update_entry::<K, V>(tree, path, now, false, |node, entry| {
                match (entry.key.clone(), entry.mapped.clone()) {
                    (Some(key), Some(mapped)) => {
                        let (key, mapped) = f((key, mapped));
                        node.set_leaf(KEY_LEAF, &key);
                        node.set_leaf(MAPPED_LEAF, &mapped);
                        true
                    }
                    _ => false,
                }
            })
        })
    }

    /// Like [`modify_key`][Self::modify_key], but also applies to outdated
    /// entries and refreshes their creation date.
    pub fn modify_key_as_new(
        &self,
        virtual_path: &str,
        f: impl Fn(K) -> K,
    ) -> Result<usize, StorageError> {
        self.write_op(virtual_path, |tree, path, now| {
            update_entry::<K, V>(tree, path, now, true, |node, entry| {
                match entry.key.clone() {
                    Some(key) => {
                        node.set_leaf(KEY_LEAF, &f(key));
                        true
                    }
                    None => false,
                }
            })
        })
    }

    /// Like [`modify_mapped`][Self::modify_mapped], but also applies to
    /// outdated entries and refreshes their creation date.
    pub fn modify_mapped_as_new(
        &self,
        virtual_path: &str,
        f: impl Fn(V) -> V,
    ) -> Result<usize, StorageError> {
        self.write_op(virtual_path, |tree, path, now| {
            update_entry::<K, V>(tree, path, now, true, |node, entry| {
                match entry.mapped.clone() {
                    Some(mapped) => {
                        node.set_leaf(MAPPED_LEAF, &f(mapped));
                        true
                    }
                    None => false,
                }
            })
        })
    }

    /// Like [`modify_value`][Self::modify_value], but also applies to
    /// outdated entries and refreshes their creation date.
    pub fn modify_value_as_new(
        &self,
        virtual_path: &str,
        f: impl Fn((K, V)) -> (K, V),
    ) -> Result<usize, StorageError> {
        self.write_op(virtual_path, |tree, path, now| {
            update_entry::<K, V>(tree, path, now, true, |node, entry| {
                match (entry.key.clone(), entry.mapped.clone()) {
                    (Some(key), Some(mapped)) => {
                        let (key, mapped) = f((key, mapped));
                        node.set_leaf(KEY_LEAF, &key);
                        node.set_leaf(MAPPED_LEAF, &mapped);
                        true
                    }
                    _ => false,
                }
            })
        })
    }

    /// Stores `value` at `virtual_path` in every mount where the path holds
    /// no entry, or only an outdated one. The entry never expires.
    ///
    /// Returns `true` if at least one mount accepted the insert.
    pub fn insert(&self, virtual_path: &str, value: (K, V)) -> Result<bool, StorageError> {
        self.insert_entry(virtual_path, value, None)
    }

    /// Stores `value` at `virtual_path` with a lifetime; once
    /// `lifetime` has elapsed the entry becomes invisible to reads and
    /// non-refreshing writes, and overwritable by inserts.
    pub fn insert_with_lifetime(
        &self,
        virtual_path: &str,
        value: (K, V),
        lifetime: Duration,
    ) -> Result<bool, StorageError> {
        self.insert_entry(virtual_path, value, Some(lifetime))
    }

    fn insert_entry(
        &self,
        virtual_path: &str,
        (key, mapped): (K, V),
        lifetime: Option<Duration>,
    ) -> Result<bool, StorageError> {
        let inserted = self.write_op(virtual_path, |tree, path, now| {
            let node = tree.ensure(path);
            let entry = EntryState::<K, V>::load(node)?;
            if entry.key.is_some() && !entry.outdated(now) {
                return Ok(false);
            }

            node.set_leaf(KEY_LEAF, &key);
            node.set_leaf(MAPPED_LEAF, &mapped);
            match lifetime {
                Some(lifetime) => {
                    node.set_leaf(DATE_CREATED_LEAF, &now);
                    node.set_leaf(LIFETIME_LEAF, &lifetime.as_secs());
                }
                None => {
                    node.remove_child(LIFETIME_LEAF);
                }
            }
            Ok(true)
        })?;
        Ok(inserted > 0)
    }

    /// Deletes the entry at `virtual_path` from every mount where it is
    /// live. Outdated entries are not removable.
    ///
    /// Returns `true` if at least one mount removed an entry.
    pub fn remove(&self, virtual_path: &str) -> Result<bool, StorageError> {
        let removed = self.write_op(virtual_path, |tree, path, now| {
            match tree.get(path) {
                Some(node) => {
                    let entry = EntryState::<K, V>::load(node)?;
                    if entry.key.is_none() || entry.outdated(now) {
                        return Ok(false);
                    }
                }
                None => return Ok(false),
            }
            Ok(tree.remove(path))
        })?;
        Ok(removed > 0)
    }

    /// Resolves `virtual_path` and copies the mount records it fans out
    /// over. The mount-table lock is released once the copy is taken.
    fn snapshot_mounts<'p>(
        &self,
        virtual_path: &'p str,
    ) -> Result<(Vec<MountPoint>, &'p str), StorageError> {
        let (accessor, remainder) = resolve_mount(&self.mount_table, virtual_path)?;
        let points = accessor.mapped().snapshot();
        Ok((points, remainder))
    }

    fn read_op<T>(
        &self,
        virtual_path: &str,
        mut pick: impl FnMut(&EntryState<K, V>) -> Option<(K, T)>,
    ) -> Result<Vec<T>, StorageError> {
        let (points, remainder) = self.snapshot_mounts(virtual_path)?;
        let now = self.clock.now_secs();

        let mut merge = PriorityMerge::new();
        for point in points {
            let Some(coordinator) = self.tom_table.find(point.tom_id.as_str()) else {
                continue;
            };
            let document_path = document_path(&point.path, remainder);

            let picked = coordinator.mapped().read(|tree| match tree.get(&document_path) {
                Some(node) => {
                    let entry = EntryState::load(node)?;
                    if entry.key.is_none() || entry.outdated(now) {
                        Ok(None)
                    } else {
                        Ok(pick(&entry))
                    }
                }
                None => Ok(None),
            })?;

            if let Some((key, item)) = picked {
                merge.offer(key, point.priority, item);
            }
        }
        Ok(merge.into_items())
    }

    fn write_op(
        &self,
        virtual_path: &str,
        apply: impl Fn(&mut TomTree, &str, u64) -> Result<bool, DocumentError>,
    ) -> Result<usize, StorageError> {
        let (points, remainder) = self.snapshot_mounts(virtual_path)?;
        let now = self.clock.now_secs();

        let mut modified = 0;
        for point in points {
            let Some(coordinator) = self.tom_table.find(point.tom_id.as_str()) else {
                continue;
            };
            let document_path = document_path(&point.path, remainder);

            if coordinator
                .mapped()
                .write(|tree| apply(tree, &document_path, now))?
            {
                modified += 1;
            }
        }
        Ok(modified)
    }
}

/// The leaves of one entry node, parsed into the storage's types.
struct EntryState<K, V> {
    key: Option<K>,
    mapped: Option<V>,
    date_created: Option<u64>,
    lifetime: Option<u64>,
}

impl<K: FromStr, V: FromStr> EntryState<K, V> {
    fn load(node: &TomTree) -> Result<Self, DocumentError> {
        Ok(Self {
            key: node.leaf(KEY_LEAF)?,
            mapped: node.leaf(MAPPED_LEAF)?,
            date_created: node.leaf(DATE_CREATED_LEAF)?,
            lifetime: node.leaf(LIFETIME_LEAF)?,
        })
    }

    /// An entry is outdated once its whole lifetime has elapsed. Entries
    /// missing either timing leaf never expire.
    fn outdated(&self, now: u64) -> bool {
        match (self.date_created, self.lifetime) {
            (Some(created), Some(lifetime)) => created + lifetime < now,
            _ => false,
        }
    }
}

/// Applies `write` to the live entry at `path`, if there is one.
///
/// Entries without a key leaf are never eligible. With `refresh` set the
/// outdated check is skipped and a successful write re-stamps the entry's
/// creation date.
fn update_entry<K, V>(
    tree: &mut TomTree,
    path: &str,
    now: u64,
    refresh: bool,
    write: impl FnOnce(&mut TomTree, &EntryState<K, V>) -> bool,
) -> Result<bool, DocumentError>
where
    K: FromStr,
    V: FromStr,
{
    let Some(node) = tree.get_mut(path) else {
        return Ok(false);
    };
    let entry = EntryState::<K, V>::load(node)?;
    if entry.key.is_none() {
        return Ok(false);
    }
    if !refresh && entry.outdated(now) {
        return Ok(false);
    }

    let wrote = write(node, &entry);
    if wrote && refresh {
        node.set_leaf(DATE_CREATED_LEAF, &now);
    }
    Ok(wrote)
}

fn document_path(real_path: &str, remainder: &str) -> String {
    let mut path = format!("{DOCUMENT_ROOT}/{real_path}");
    if !remainder.is_empty() {
        path.push('/');
        path.push_str(remainder);
    }
    path
}

/// The read-side result collection: per merge key, only candidates of the
/// highest priority seen so far survive, with equal-priority duplicates
/// preserved.
struct PriorityMerge<K, T> {
    slots: HashMap<K, (usize, Vec<T>)>,
}

impl<K: Hash + Eq, T> PriorityMerge<K, T> {
    fn new() -> Self {
        Self {
            slots: HashMap::new(),
        }
    }

    fn offer(&mut self, key: K, priority: usize, item: T) {
        match self.slots.entry(key) {
            std::collections::hash_map::Entry::Occupied(mut occupied) => {
                let (held, items) = occupied.get_mut();
                if priority > *held {
                    *held = priority;
                    items.clear();
                    items.push(item);
                } else if priority == *held {
                    items.push(item);
                }
            }
            std::collections::hash_map::Entry::Vacant(vacant) => {
                vacant.insert((priority, vec![item]));
            }
        }
    }

    fn into_items(self) -> Vec<T> {
        self.slots
            .into_values()
            .flat_map(|(_, items)| items)
            .collect()
    }
}
