use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::{Mutex, MutexGuard};

use crate::common::error::DocumentError;

use super::document::{read_tom, write_tom, TomTree};

/// Serializes access to one tom and manages the lifetime of its in-memory
/// tree.
///
/// Every operation announces itself on the matching pending counter before
/// blocking on the mutex, and withdraws the announcement once inside. The
/// counters are what the in-progress operation consults on its way out:
///
/// - a write flushes the tree back to the XML file only when no further
///   writers are pending, collapsing a burst of writes into one flush;
/// - the tree is dropped once neither readers nor writers are pending, so
///   an idle tom costs no memory.
///
/// The counters are statistics, not serialization primitives; all tree
/// access happens under the mutex.
pub(crate) struct TomCoordinator {
    tom_id: String,
    tree: Mutex<Option<TomTree>>,
    pending_readers: AtomicUsize,
    pending_writers: AtomicUsize,
}

impl TomCoordinator {
    pub(crate) fn new(tom_id: String) -> Self {
        Self {
            tom_id,
            tree: Mutex::new(None),
            pending_readers: AtomicUsize::new(0),
            pending_writers: AtomicUsize::new(0),
        }
    }

    /// Runs `body` against the tom's tree, loading it first if no other
    /// operation left it in memory.
    pub(crate) fn read<R>(
        &self,
        body: impl FnOnce(&TomTree) -> Result<R, DocumentError>,
    ) -> Result<R, DocumentError> {
        self.pending_readers.fetch_add(1, Ordering::Relaxed);
        let mut slot = self.tree.lock();
        self.pending_readers.fetch_sub(1, Ordering::Relaxed);

        let result = body(self.materialize(&mut slot)?);
        self.drop_tree_if_quiescent(&mut slot);
        result
    }

    /// Runs `body` against the tom's tree for mutation, then flushes the
    /// tree back to the XML file if this was the last writer in the burst.
    pub(crate) fn write<R>(
        &self,
        body: impl FnOnce(&mut TomTree) -> Result<R, DocumentError>,
    ) -> Result<R, DocumentError> {
        self.pending_writers.fetch_add(1, Ordering::Relaxed);
        let mut slot = self.tree.lock();
        self.pending_writers.fetch_sub(1, Ordering::Relaxed);

        let result = body(self.materialize(&mut slot)?);

        if result.is_ok() && self.pending_writers.load(Ordering::Relaxed) == 0 {
            let tree = slot.as_ref().expect("tree was materialized above");
            write_tom(&self.tom_id, tree)?;
            log::debug!("flushed tom `{}`", self.tom_id);
        }

        self.drop_tree_if_quiescent(&mut slot);
        result
    }

    fn materialize<'a>(
        &self,
        slot: &'a mut MutexGuard<'_, Option<TomTree>>,
    ) -> Result<&'a mut TomTree, DocumentError> {
        if slot.is_none() {
            **slot = Some(read_tom(&self.tom_id)?);
            log::debug!("materialized tom `{}`", self.tom_id);
        }
        Ok(slot.as_mut().expect("just materialized"))
    }

    fn drop_tree_if_quiescent(&self, slot: &mut MutexGuard<'_, Option<TomTree>>) {
        if self.pending_readers.load(Ordering::Relaxed) == 0
            && self.pending_writers.load(Ordering::Relaxed) == 0
            && slot.take().is_some()
        {
            log::debug!("dropped quiescent tom `{}`", self.tom_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::TomCoordinator;
    use crate::store::document::{read_tom, write_tom, TomTree};

    fn temp_tom() -> String {
        let path = std::env::temp_dir()
            .join(format!("tomstore-coord-{}.xml", uuid::Uuid::new_v4()))
            .to_string_lossy()
            .into_owned();
        let mut tree = TomTree::new();
        tree.ensure("tom/root/counter").set_leaf("key", &0);
        write_tom(&path, &tree).unwrap();
        path
    }

    #[test]
    fn read_sees_the_document() {
        let path = temp_tom();
        let coordinator = TomCoordinator::new(path.clone());

        let key = coordinator
            .read(|tree| tree.get("tom/root/counter").unwrap().leaf::<u64>("key"))
            .unwrap();
        assert_eq!(key, Some(0));

        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn write_flushes_on_quiescence() {
        let path = temp_tom();
        let coordinator = TomCoordinator::new(path.clone());

        coordinator
            .write(|tree| {
                tree.ensure("tom/root/counter").set_leaf("key", &7);
                Ok(())
            })
            .unwrap();

        // No other writer was pending, so the file must already hold the
        // new value.
        let on_disk = read_tom(&path).unwrap();
        assert_eq!(
            on_disk.get("tom/root/counter/key").map(TomTree::value),
            Some("7")
        );

        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn missing_document_fails_the_operation() {
        let coordinator = TomCoordinator::new("/nonexistent/tomstore/tom.xml".to_owned());
        assert!(coordinator.read(|_| Ok(())).is_err());
    }

    #[test]
    fn concurrent_writers_serialize_and_persist() {
        const THREADS: usize = 8;
        const PER_THREAD: usize = 25;

        let path = temp_tom();
        let coordinator = TomCoordinator::new(path.clone());

        std::thread::scope(|s| {
            for _ in 0..THREADS {
                let coordinator = &coordinator;
                s.spawn(move || {
                    for _ in 0..PER_THREAD {
                        coordinator
                            .write(|tree| {
                                let node = tree.ensure("tom/root/counter");
                                let current = node.leaf::<u64>("key")?.unwrap_or(0);
                                node.set_leaf("key", &(current + 1));
                                Ok(())
                            })
                            .unwrap();
                    }
                });
            }
        });

        // The last writer to finish observed zero pending writers and
        // flushed the final state.
        let on_disk = read_tom(&path).unwrap();
        assert_eq!(
            on_disk
                .get("tom/root/counter")
                .unwrap()
                .leaf::<u64>("key")
                .unwrap(),
            Some((THREADS * PER_THREAD) as u64)
        );

        std::fs::remove_file(&path).unwrap();
    }
}
