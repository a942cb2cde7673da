//! Path splitting and the boundary behaviours spec.md §8 pins down:
//! empty path, relative path, and trailing-slash path are all
//! invalid-argument; the root path resolves without any RPC.

use crate::error::ClientError;

/// The directory an operation will run against, plus enough of its own
/// attributes to seed the index cache on first use (spec.md §4.7's
/// lookup-cache entry shape, minus the lease, which belongs to the
/// cache entry that produced it).
#[derive(Debug, Clone, Copy)]
pub struct ResolvedDir {
    pub inode: i64,
    pub zeroth_server: i16,
}

impl ResolvedDir {
    pub const ROOT: ResolvedDir = ResolvedDir {
        inode: 0,
        zeroth_server: 0,
    };
}

/// The result of walking every path component but the last: the parent
/// directory the leaf lives in, and the leaf's own name.
#[derive(Debug, Clone)]
pub struct PathResolution {
    pub parent: ResolvedDir,
    pub leaf: String,
}

/// Outcome of resolving a path down to its last unresolved component
/// (spec.md §8): the root path has no parent/leaf to split, everything
/// else does.
#[derive(Debug, Clone)]
pub enum Resolved {
    Root,
    Child(PathResolution),
}

/// Splits `path` into its `/`-separated components, rejecting the
/// boundary cases spec.md §8 names. Returns `Ok(None)` for the root
/// path, which needs no further resolution.
pub fn split_path(path: &str) -> Result<Option<Vec<&str>>, ClientError> {
    if path.is_empty() {
        return Err(ClientError::InvalidArgument("path is empty".to_string()));
    }
    if !path.starts_with('/') {
        return Err(ClientError::InvalidArgument(format!(
            "path {path:?} is relative"
        )));
    }
    if path == "/" {
        return Ok(None);
    }
    if path.ends_with('/') {
        return Err(ClientError::InvalidArgument(format!(
            "path {path:?} has a trailing slash"
        )));
    }
    let components: Vec<&str> = path[1..].split('/').collect();
    if components.iter().any(|c| c.is_empty()) {
        return Err(ClientError::InvalidArgument(format!(
            "path {path:?} has an empty component"
        )));
    }
    Ok(Some(components))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_path_has_no_components() {
        assert!(split_path("/").unwrap().is_none());
    }

    #[test]
    fn ordinary_path_splits_on_slash() {
        assert_eq!(split_path("/a/b/c").unwrap(), Some(vec!["a", "b", "c"]));
    }

    #[test]
    fn empty_path_is_invalid() {
        assert!(matches!(split_path(""), Err(ClientError::InvalidArgument(_))));
    }

    #[test]
    fn relative_path_is_invalid() {
        assert!(matches!(split_path("a/b"), Err(ClientError::InvalidArgument(_))));
    }

    #[test]
    fn trailing_slash_path_is_invalid() {
        assert!(matches!(split_path("/a/b/"), Err(ClientError::InvalidArgument(_))));
    }

    #[test]
    fn double_slash_is_invalid() {
        assert!(matches!(split_path("/a//b"), Err(ClientError::InvalidArgument(_))));
    }
}
