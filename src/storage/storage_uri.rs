use std::path::PathBuf;

use derive_more::From;
use thiserror::Error;

/// The scheme assumed for URIs without one.
const DEFAULT_SCHEME: &str = "file";

/// A storage URI of the form `<scheme>://<path>`, e.g. `file:///data/arrays/a` or `mem://arrays/a`.
///
/// A string without a scheme is interpreted as a local filesystem path.
/// Trailing `/` characters are removed.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct StorageUri {
    scheme: String,
    path: String,
}

/// An invalid storage URI.
#[derive(Debug, From, Error)]
#[error("invalid storage uri {0}")]
pub struct StorageUriError(String);

impl StorageUri {
    /// Create a new storage URI from `uri`.
    ///
    /// # Errors
    /// Returns [`StorageUriError`] if the scheme or path is empty, or the scheme contains characters other than ASCII alphanumerics, `+`, `-` and `.`.
    pub fn new(uri: impl AsRef<str>) -> Result<Self, StorageUriError> {
        let uri = uri.as_ref();
        let (scheme, path) = uri.split_once("://").unwrap_or((DEFAULT_SCHEME, uri));
        let valid_scheme = !scheme.is_empty()
            && scheme
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'));
        let path = if path.len() > 1 {
            path.trim_end_matches('/')
        } else {
            path
        };
        if valid_scheme && !path.is_empty() {
            Ok(Self {
                scheme: scheme.to_ascii_lowercase(),
                path: path.to_string(),
            })
        } else {
            Err(StorageUriError(uri.to_string()))
        }
    }

    /// Return the scheme (e.g. `file`, `mem`).
    #[must_use]
    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    /// Return the path component.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Return the path as a local filesystem path.
    #[must_use]
    pub fn to_path_buf(&self) -> PathBuf {
        PathBuf::from(&self.path)
    }

    /// Return the final component of the path.
    #[must_use]
    pub fn last_path_part(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }

    /// Return a child URI with `name` appended to the path.
    ///
    /// # Errors
    /// Returns [`StorageUriError`] if `name` is empty or begins or ends with `/`.
    pub fn join(&self, name: &str) -> Result<Self, StorageUriError> {
        if name.is_empty() || name.starts_with('/') || name.ends_with('/') {
            return Err(StorageUriError(format!("{self} + {name}")));
        }
        let path = if self.path.ends_with('/') {
            format!("{}{name}", self.path)
        } else {
            format!("{}/{name}", self.path)
        };
        Ok(Self {
            scheme: self.scheme.clone(),
            path,
        })
    }

    /// Return the parent URI, or [`None`] if the path has a single component.
    #[must_use]
    pub fn parent(&self) -> Option<Self> {
        let (parent, _) = self.path.rsplit_once('/')?;
        let parent = if parent.is_empty() { "/" } else { parent };
        if parent == self.path {
            return None;
        }
        Some(Self {
            scheme: self.scheme.clone(),
            path: parent.to_string(),
        })
    }

    /// Returns true if this URI is `other` or a descendant of `other`.
    #[must_use]
    pub fn starts_with(&self, other: &StorageUri) -> bool {
        self.scheme == other.scheme
            && (self.path == other.path
                || self
                    .path
                    .strip_prefix(other.path.as_str())
                    .is_some_and(|rest| rest.starts_with('/') || other.path.ends_with('/')))
    }
}

impl std::fmt::Display for StorageUri {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
        write!(f, "{}://{}", self.scheme, self.path)
    }
}

impl std::str::FromStr for StorageUri {
    type Err = StorageUriError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<&str> for StorageUri {
    type Error = StorageUriError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_uri_parse() {
        let uri = StorageUri::new("mem://arrays/a/").unwrap();
        assert_eq!(uri.scheme(), "mem");
        assert_eq!(uri.path(), "arrays/a");
        assert_eq!(uri.to_string(), "mem://arrays/a");

        let uri = StorageUri::new("/tmp/array").unwrap();
        assert_eq!(uri.scheme(), "file");
        assert_eq!(uri.to_string(), "file:///tmp/array");
        assert_eq!(uri, StorageUri::new("file:///tmp/array").unwrap());

        assert!(StorageUri::new("").is_err());
        assert!(StorageUri::new("mem://").is_err());
        assert!(StorageUri::new("s 3://bucket").is_err());
        assert_eq!(StorageUri::new("S3://bucket").unwrap().scheme(), "s3");
    }

    #[test]
    fn storage_uri_join_parent() {
        let uri = StorageUri::new("mem://arrays/a").unwrap();
        let child = uri.join("__fragments").unwrap();
        assert_eq!(child.to_string(), "mem://arrays/a/__fragments");
        assert_eq!(child.last_path_part(), "__fragments");
        assert_eq!(child.parent().unwrap(), uri);
        assert!(child.starts_with(&uri));
        assert!(!StorageUri::new("mem://arrays/ab").unwrap().starts_with(&uri));
        assert!(uri.join("").is_err());
        assert!(uri.join("/x").is_err());
        assert_eq!(StorageUri::new("mem://a").unwrap().parent(), None);

        let root = StorageUri::new("file:///").unwrap();
        assert_eq!(root.join("tmp").unwrap().to_string(), "file:///tmp");
        assert_eq!(
            StorageUri::new("file:///tmp").unwrap().parent().unwrap(),
            root
        );
        assert_eq!(root.parent(), None);
    }
}
