//! Logical object keys and the canonical backend paths they resolve to.

use crate::errors::{UploaderError, UploaderResult};
use serde::Serialize;
use std::{
    fmt,
    path::{Component, Path},
};

const MAX_OBJECT_KEY_LEN: usize = 1024;

/// A validated, relative, `/`-separated key inside a backup's namespace.
///
/// Built from normal path segments only, so two distinct keys never join
/// to the same string.
#[derive(Serialize, Clone, Debug, PartialEq, Eq, Hash)]
pub struct ObjectKey {
    segments: Vec<String>,
}

impl ObjectKey {
    /// Build a key from a local relative path such as `keyspace/table/mc-1-big-Data.db`.
    ///
    /// Rejects absolute paths, `.`/`..` components, empty keys, and segments
    /// carrying control characters or backslashes.
    pub fn from_path(path: &Path) -> UploaderResult<Self> {
        let invalid = || UploaderError::InvalidObjectKey(path.display().to_string());

        let mut segments = Vec::new();
        for component in path.components() {
            match component {
                Component::Normal(segment) => {
                    let segment = segment.to_str().ok_or_else(invalid)?;
                    if segment
                        .bytes()
                        .any(|b| b.is_ascii_control() || b == b'\\' || b == b'/')
                    {
                        return Err(invalid());
                    }
                    segments.push(segment.to_string());
                }
                _ => return Err(invalid()),
            }
        }

        let key = Self { segments };
        if key.segments.is_empty() || key.to_string().len() > MAX_OBJECT_KEY_LEN {
            return Err(invalid());
        }
        Ok(key)
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.segments.join("/"))
    }
}

/// Immutable pairing of a logical key with the path the backend understands.
#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
pub struct RemoteObjectReference {
    /// Key within the backup's logical namespace.
    pub object_key: ObjectKey,

    /// Fully-resolved backend path, e.g. `cluster-a/backup-42/ks/tbl/Data.db`.
    pub canonical_path: String,
}

impl fmt::Display for RemoteObjectReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical_path)
    }
}

/// Resolves object keys under `{cluster_id}/{backup_id}/`.
#[derive(Clone, Debug)]
pub struct RemotePathResolver {
    cluster_id: String,
    backup_id: String,
}

impl RemotePathResolver {
    pub fn new(cluster_id: impl Into<String>, backup_id: impl Into<String>) -> UploaderResult<Self> {
        let cluster_id = cluster_id.into();
        let backup_id = backup_id.into();
        ensure_identifier_safe("cluster id", &cluster_id)?;
        ensure_identifier_safe("backup id", &backup_id)?;
        Ok(Self {
            cluster_id,
            backup_id,
        })
    }

    /// Prefix that scopes every object (and every multipart upload) this cluster owns.
    pub fn cluster_prefix(&self) -> String {
        format!("{}/", self.cluster_id)
    }

    pub fn resolve(&self, key: &Path) -> UploaderResult<RemoteObjectReference> {
        let object_key = ObjectKey::from_path(key)?;
        let canonical_path = format!("{}/{}/{}", self.cluster_id, self.backup_id, object_key);
        Ok(RemoteObjectReference {
            object_key,
            canonical_path,
        })
    }
}

fn ensure_identifier_safe(kind: &'static str, value: &str) -> UploaderResult<()> {
    if value.is_empty()
        || value == "."
        || value == ".."
        || value
            .bytes()
            .any(|b| b == b'/' || b == b'\\' || b.is_ascii_control())
    {
        return Err(UploaderError::InvalidIdentifier {
            kind,
            value: value.to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn resolver() -> RemotePathResolver {
        RemotePathResolver::new("cluster-a", "backup-42").unwrap()
    }

    #[test]
    fn resolves_under_cluster_and_backup() {
        let reference = resolver()
            .resolve(Path::new("ks/tbl/mc-1-big-Data.db"))
            .unwrap();
        assert_eq!(
            reference.canonical_path,
            "cluster-a/backup-42/ks/tbl/mc-1-big-Data.db"
        );
        assert_eq!(reference.object_key.segments().len(), 3);
    }

    #[test]
    fn resolution_is_deterministic() {
        let key = PathBuf::from("ks/tbl/manifest.json");
        let first = resolver().resolve(&key).unwrap();
        let second = resolver().resolve(&key).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.canonical_path, second.canonical_path);
    }

    #[test]
    fn different_keys_never_collide() {
        let a = resolver().resolve(Path::new("ks/a")).unwrap();
        let b = resolver().resolve(Path::new("ks/b")).unwrap();
        assert_ne!(a.canonical_path, b.canonical_path);
    }

    #[test]
    fn rejects_unsafe_keys() {
        for bad in ["", "/etc/passwd", "ks/../tbl", "./ks", "ks/a\\b"] {
            assert!(
                resolver().resolve(Path::new(bad)).is_err(),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn rejects_overlong_keys() {
        let long = "a".repeat(MAX_OBJECT_KEY_LEN + 1);
        assert!(matches!(
            resolver().resolve(Path::new(&long)),
            Err(UploaderError::InvalidObjectKey(_))
        ));
    }

    #[test]
    fn rejects_identifiers_with_separators() {
        assert!(RemotePathResolver::new("a/b", "backup").is_err());
        assert!(RemotePathResolver::new("cluster", "").is_err());
        assert!(RemotePathResolver::new("cluster", "..").is_err());
    }

    #[test]
    fn cluster_prefix_ends_with_separator() {
        assert_eq!(resolver().cluster_prefix(), "cluster-a/");
    }
}
