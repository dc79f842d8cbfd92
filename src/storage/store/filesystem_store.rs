//! A filesystem store.

#[cfg(unix)]
use crate::storage::{BackendLock, BackendLockGuard, LockMode};
use crate::{
    byte_range::ByteRange,
    storage::{ReadOptions, Storage, StorageBackend, StorageBackendPlugin, StorageError, StorageUri},
};

use parking_lot::{Mutex, RwLock};

use std::{
    collections::HashMap,
    fs::{File, OpenOptions},
    io::{Read, Seek, SeekFrom, Write},
    path::PathBuf,
    sync::Arc,
};

// Register the store.
inventory::submit! {
    StorageBackendPlugin::new("file", create_store_filesystem)
}

fn create_store_filesystem() -> Storage {
    Arc::new(FilesystemStore::new())
}

/// A synchronous file system store.
///
/// The path of a `file://` URI is used as the filesystem path.
/// Reads and writes of an object share a per-file lock; deleting it takes the lock exclusively.
#[derive(Debug, Default)]
pub struct FilesystemStore {
    files: Mutex<HashMap<PathBuf, Arc<RwLock<()>>>>,
}

/// An advisory `flock` held on a file.
#[cfg(unix)]
#[derive(Debug)]
struct FilesystemLock {
    file: File,
    mode: LockMode,
}

#[cfg(unix)]
impl BackendLockGuard for FilesystemLock {
    fn mode(&self) -> LockMode {
        self.mode
    }
}

#[cfg(unix)]
impl Drop for FilesystemLock {
    fn drop(&mut self) {
        use std::os::unix::io::AsRawFd;
        // Closing the file also releases the lock
        unsafe {
            libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
        }
    }
}

impl FilesystemStore {
    /// Create a new file system store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn get_file_mutex(&self, path: &PathBuf) -> Arc<RwLock<()>> {
        let mut files = self.files.lock();
        let file = files
            .entry(path.clone())
            .or_insert_with(|| Arc::new(RwLock::default()))
            .clone();
        drop(files);
        file
    }

    fn io_error(&self, uri: &StorageUri, err: std::io::Error) -> StorageError {
        if err.kind() == std::io::ErrorKind::NotFound {
            StorageError::NotFound(uri.clone())
        } else {
            StorageError::io(self.name(), uri, err)
        }
    }
}

/// Advise the kernel that `file` will be accessed randomly, disabling read-ahead.
#[cfg(target_os = "linux")]
fn advise_random_access(file: &File) {
    use std::os::unix::io::AsRawFd;
    // Advice is a hint, failure is not an error
    unsafe {
        libc::posix_fadvise(file.as_raw_fd(), 0, 0, libc::POSIX_FADV_RANDOM);
    }
}

#[cfg(not(target_os = "linux"))]
fn advise_random_access(_file: &File) {}

impl StorageBackend for FilesystemStore {
    fn name(&self) -> &'static str {
        "file"
    }

    fn read(
        &self,
        uri: &StorageUri,
        offset: u64,
        buffer: &mut [u8],
        options: &ReadOptions,
    ) -> Result<(), StorageError> {
        let path = uri.to_path_buf();
        let file = self.get_file_mutex(&path);
        let _lock = file.read();

        let mut file = File::open(&path).map_err(|err| self.io_error(uri, err))?;
        let size = file
            .metadata()
            .map_err(|err| self.io_error(uri, err))?
            .len();
        let byte_range = ByteRange::new(offset, buffer.len() as u64);
        if byte_range.end() > size {
            return Err(StorageError::OutOfBounds {
                uri: uri.clone(),
                byte_range,
                size,
            });
        }
        if !options.read_ahead() {
            advise_random_access(&file);
        }

        file.seek(SeekFrom::Start(offset))
            .and_then(|_| file.read_exact(buffer))
            .map_err(|err| self.io_error(uri, err))
    }

    fn write(&self, uri: &StorageUri, offset: u64, data: &[u8]) -> Result<(), StorageError> {
        let path = uri.to_path_buf();
        let file = self.get_file_mutex(&path);
        let _lock = file.read();

        // Create directories
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|err| self.io_error(uri, err))?;
            }
        }

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|err| self.io_error(uri, err))?;

        // Write
        file.seek(SeekFrom::Start(offset))
            .and_then(|_| file.write_all(data))
            .map_err(|err| self.io_error(uri, err))
    }

    fn size(&self, uri: &StorageUri) -> Result<Option<u64>, StorageError> {
        match std::fs::metadata(uri.to_path_buf()) {
            Ok(metadata) if metadata.is_file() => Ok(Some(metadata.len())),
            Ok(_) => Ok(None),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(self.io_error(uri, err)),
        }
    }

    fn delete(&self, uri: &StorageUri) -> Result<(), StorageError> {
        let path = uri.to_path_buf();
        let file = self.get_file_mutex(&path);
        let lock = file.write();

        let result = match std::fs::symlink_metadata(&path) {
            Ok(metadata) if metadata.is_dir() => std::fs::remove_dir_all(&path),
            Ok(_) => std::fs::remove_file(&path),
            Err(err) => Err(err),
        };
        drop(lock);
        self.files.lock().retain(|file, _| !file.starts_with(&path));
        match result {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(self.io_error(uri, err)),
        }
    }

    fn list(&self, parent: &StorageUri) -> Result<Vec<StorageUri>, StorageError> {
        let path = parent.to_path_buf();
        if !path.is_dir() {
            return Ok(Vec::new());
        }
        let dir = std::fs::read_dir(&path).map_err(|err| self.io_error(parent, err))?;
        let mut children = Vec::new();
        for entry in dir {
            let entry = entry.map_err(|err| self.io_error(parent, err))?;
            let name = entry.file_name();
            let name = name.to_str().ok_or_else(|| {
                StorageError::Other(format!(
                    "non-unicode file name {} in {parent}",
                    name.to_string_lossy()
                ))
            })?;
            children.push(parent.join(name)?);
        }
        children.sort();
        Ok(children)
    }

    #[cfg(unix)]
    fn lock(&self, uri: &StorageUri, mode: LockMode) -> Result<Option<BackendLock>, StorageError> {
        use std::os::unix::io::AsRawFd;

        let path = uri.to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|err| self.io_error(uri, err))?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|err| self.io_error(uri, err))?;
        let operation = match mode {
            LockMode::Shared => libc::LOCK_SH,
            LockMode::Exclusive => libc::LOCK_EX,
        };
        if unsafe { libc::flock(file.as_raw_fd(), operation) } != 0 {
            return Err(self.io_error(uri, std::io::Error::last_os_error()));
        }
        Ok(Some(Box::new(FilesystemLock { file, mode })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::store::test_util;
    use std::error::Error;

    fn base_uri(path: &tempfile::TempDir) -> Result<StorageUri, Box<dyn Error>> {
        Ok(StorageUri::new(format!(
            "file://{}",
            path.path().to_str().unwrap()
        ))?)
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn filesystem() -> Result<(), Box<dyn Error>> {
        let path = tempfile::TempDir::new()?;
        let base = base_uri(&path)?;
        let store = FilesystemStore::new();
        test_util::store_write(&store, &base)?;
        test_util::store_read(&store, &base)?;
        test_util::store_list(&store, &base)?;
        test_util::store_delete(&store, &base)?;
        Ok(())
    }

    #[test]
    #[cfg(unix)]
    #[cfg_attr(miri, ignore)]
    fn filesystem_lock() -> Result<(), Box<dyn Error>> {
        let path = tempfile::TempDir::new()?;
        let uri = base_uri(&path)?.join("array/__lock")?;
        let store = FilesystemStore::new();
        let a = store.lock(&uri, LockMode::Shared)?.unwrap();
        let b = store.lock(&uri, LockMode::Shared)?.unwrap();
        assert_eq!(a.mode(), LockMode::Shared);
        assert_eq!(b.mode(), LockMode::Shared);
        assert_eq!(store.size(&uri)?, Some(0));
        Ok(())
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn filesystem_delete_directory_releases_files() -> Result<(), Box<dyn Error>> {
        let path = tempfile::TempDir::new()?;
        let base = base_uri(&path)?;
        let store = FilesystemStore::new();
        let sibling = base.join("b/object")?;
        store.write(&sibling, 0, &[1])?;
        for name in ["a/object", "a/nested/object"] {
            store.write(&base.join(name)?, 0, &[1, 2])?;
        }
        assert_eq!(store.files.lock().len(), 3);

        store.delete(&base.join("a")?)?;
        assert_eq!(store.size(&base.join("a/object")?)?, None);
        let files = store.files.lock();
        assert_eq!(files.len(), 1);
        assert!(files.contains_key(&sibling.to_path_buf()));
        Ok(())
    }
}
