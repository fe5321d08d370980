//! Skip filter for file lists replayed from a cache: keeps only entries that belong to one of the
//! requested sources.

use crate::path::{self, ParamPath};

/// Index of the first source that `entry_path` equals or lies underneath.
pub fn matching_source(entry_path: &std::path::Path, sources: &[ParamPath]) -> Option<usize> {
    sources
        .iter()
        .position(|src| path::is_same_or_descendant(entry_path, src.path()))
}

/// True iff `entry_path` equals one of the sources or is a descendant of one.
pub fn should_copy(entry_path: &std::path::Path, sources: &[ParamPath]) -> bool {
    let source = matching_source(entry_path, sources);
    match source {
        Some(index) => tracing::debug!(
            "need to copy {:?} because of {:?}",
            entry_path,
            sources[index].path()
        ),
        None => tracing::debug!("skip {:?}", entry_path),
    }
    source.is_some()
}

/// Pairs `(first, later)` of sources where one lies inside the other. Entries under both belong
/// to `first` only, since [`matching_source`] picks the first match.
pub fn overlapping_sources(sources: &[ParamPath]) -> Vec<(usize, usize)> {
    let mut pairs = Vec::new();
    for (first, outer) in sources.iter().enumerate() {
        for (later, inner) in sources.iter().enumerate().skip(first + 1) {
            if path::is_same_or_descendant(inner.path(), outer.path())
                || path::is_same_or_descendant(outer.path(), inner.path())
            {
                pairs.push((first, later));
            }
        }
    }
    pairs
}
