use std::hash::BuildHasher;

use crate::{
    common::error::StorageError,
    map::{SegmentedHashMap, SharedAccessor},
};

use super::mount::MountSet;

/// Splits a virtual path into its longest mounted prefix and the remainder.
///
/// Prefixes are tried at every `'/'` boundary and the longest one present
/// in the mount table wins, so a mount id may itself contain slashes. The
/// returned accessor holds the mount-table bucket's shared lock on the
/// winning entry; the remainder is empty when the path names the mount
/// point itself.
///
/// Fails with [`StorageError::UnmountedPath`] when no prefix is mounted;
/// the empty path is never mounted.
pub(crate) fn resolve_mount<'a, 'p, S>(
    mount_table: &'a SegmentedHashMap<String, MountSet, S>,
    virtual_path: &'p str,
) -> Result<(SharedAccessor<'a, String, MountSet>, &'p str), StorageError>
where
    S: BuildHasher,
{
    // Probe accessors are dropped before the next lookup; holding one
    // while the next probe runs its rehash gate could deadlock on our own
    // shared lock.
    let mut longest: Option<usize> = None;
    for end in prefix_ends(virtual_path) {
        if mount_table.find(&virtual_path[..end]).is_some() {
            longest = Some(end);
        }
    }

    let end = longest.ok_or_else(|| StorageError::UnmountedPath(virtual_path.to_owned()))?;
    let accessor = mount_table
        .find(&virtual_path[..end])
        .ok_or_else(|| StorageError::UnmountedPath(virtual_path.to_owned()))?;

    let remainder = virtual_path[end..].trim_start_matches('/');
    Ok((accessor, remainder))
}

/// Byte offsets of every prefix of `path` that ends at a segment boundary,
/// shortest first.
fn prefix_ends(path: &str) -> impl Iterator<Item = usize> + '_ {
    path.char_indices()
        .filter_map(|(index, c)| (c == '/' && index > 0).then_some(index))
        .chain((!path.is_empty()).then_some(path.len()))
}

#[cfg(test)]
mod tests {
    use super::resolve_mount;
    use crate::{common::error::StorageError, map::SegmentedHashMap, store::mount::MountSet};

    fn table_with(ids: &[&str]) -> SegmentedHashMap<String, MountSet> {
        let table = SegmentedHashMap::new();
        for id in ids {
            drop(table.emplace((*id).to_owned(), MountSet::new()));
        }
        table
    }

    #[test]
    fn resolves_single_segment_mount() {
        let table = table_with(&["mnt"]);

        let (accessor, remainder) = resolve_mount(&table, "mnt/d").unwrap();
        assert_eq!(accessor.key(), "mnt");
        assert_eq!(remainder, "d");
    }

    #[test]
    fn resolves_exact_mount_with_empty_remainder() {
        let table = table_with(&["mnt"]);

        let (accessor, remainder) = resolve_mount(&table, "mnt").unwrap();
        assert_eq!(accessor.key(), "mnt");
        assert_eq!(remainder, "");
    }

    #[test]
    fn prefers_the_longest_prefix() {
        let table = table_with(&["mnt", "mnt/deep"]);

        let (accessor, remainder) = resolve_mount(&table, "mnt/deep/x").unwrap();
        assert_eq!(accessor.key(), "mnt/deep");
        assert_eq!(remainder, "x");

        let (accessor, remainder) = resolve_mount(&table, "mnt/other/x").unwrap();
        assert_eq!(accessor.key(), "mnt");
        assert_eq!(remainder, "other/x");
    }

    #[test]
    fn unmounted_paths_fail() {
        let table = table_with(&["mnt"]);

        assert!(matches!(
            resolve_mount(&table, "elsewhere/d"),
            Err(StorageError::UnmountedPath(path)) if path == "elsewhere/d"
        ));
        assert!(matches!(
            resolve_mount(&table, ""),
            Err(StorageError::UnmountedPath(_))
        ));
    }
}
