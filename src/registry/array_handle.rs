use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use crate::{
    fragment::FragmentId,
    schema::ArraySchema,
    storage::StorageUri,
};

use super::{FragmentMetadataRef, OpenArray, Registry, RegistryError};

/// An open handle to an array, returned by [`Registry::open`].
///
/// The handle is closed by [`ArrayHandle::close`] or when it is dropped.
/// Closing a handle more than once is a no-op.
#[derive(Debug)]
pub struct ArrayHandle {
    registry: Registry,
    array: Arc<OpenArray>,
    schema: Arc<ArraySchema>,
    closed: AtomicBool,
}

impl ArrayHandle {
    pub(super) fn new(registry: Registry, array: Arc<OpenArray>, schema: Arc<ArraySchema>) -> Self {
        Self {
            registry,
            array,
            schema,
            closed: AtomicBool::new(false),
        }
    }

    /// Return the array URI.
    #[must_use]
    pub fn uri(&self) -> &StorageUri {
        self.array.uri()
    }

    /// Return the array schema.
    #[must_use]
    pub fn schema(&self) -> &Arc<ArraySchema> {
        &self.schema
    }

    /// Return the shared open array record.
    #[must_use]
    pub fn open_array(&self) -> &Arc<OpenArray> {
        &self.array
    }

    /// Returns true if the handle has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Return the metadata of `fragment`, fetching it on a miss.
    ///
    /// # Errors
    /// See [`Registry::get_or_fetch_fragment_metadata`].
    pub fn fragment_metadata(
        &self,
        fragment: &FragmentId,
    ) -> Result<FragmentMetadataRef, RegistryError> {
        self.registry.get_or_fetch_fragment_metadata(self, fragment)
    }

    /// Invalidate the cached metadata of `fragment`.
    ///
    /// See [`Registry::invalidate_fragment_metadata`].
    pub fn invalidate_fragment_metadata(&self, fragment: &FragmentId) {
        self.registry.invalidate(&self.array, fragment);
    }

    /// Close the handle.
    ///
    /// Returns false if the handle was already closed.
    pub fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.registry.close_array(&self.array);
        true
    }
}

impl Drop for ArrayHandle {
    fn drop(&mut self) {
        self.close();
    }
}
