use crate::{scheduler::IoScheduler, storage::StorageUri};

use super::{commits_uri, FragmentError, FragmentId, COMMIT_SUFFIX, VACUUM_SUFFIX};

/// The committed fragments of an array, read from its commit directory.
#[derive(Clone, Debug, Default)]
pub struct FragmentInfo {
    committed: Vec<FragmentId>,
    vacuum: Vec<FragmentId>,
}

impl FragmentInfo {
    /// List the commit directory of `array`.
    ///
    /// Entries that are not commit markers or vacuum files are ignored.
    ///
    /// # Errors
    /// Returns a [`FragmentError`] if the commit directory cannot be listed.
    pub fn load(scheduler: &IoScheduler, array: &StorageUri) -> Result<Self, FragmentError> {
        let mut committed = Vec::new();
        let mut vacuum = Vec::new();
        for uri in scheduler.list(&commits_uri(array)?)? {
            let name = uri.last_path_part();
            if let Some(id) = name.strip_suffix(COMMIT_SUFFIX) {
                if let Ok(id) = id.parse() {
                    committed.push(id);
                }
            } else if let Some(id) = name.strip_suffix(VACUUM_SUFFIX) {
                if let Ok(id) = id.parse() {
                    vacuum.push(id);
                }
            }
        }
        committed.sort();
        vacuum.sort();
        Ok(Self { committed, vacuum })
    }

    /// Return every committed fragment in creation order, including superseded fragments.
    #[must_use]
    pub fn committed(&self) -> &[FragmentId] {
        &self.committed
    }

    /// Returns true if `fragment` is committed.
    #[must_use]
    pub fn is_committed(&self, fragment: &FragmentId) -> bool {
        self.committed.binary_search(fragment).is_ok()
    }

    /// Return the committed fragments in creation order, excluding any fragment superseded by a consolidated fragment.
    ///
    /// A fragment is superseded if the timestamp range of another committed fragment strictly contains its own.
    #[must_use]
    pub fn visible(&self) -> Vec<FragmentId> {
        self.committed
            .iter()
            .filter(|fragment| !self.is_superseded(fragment))
            .copied()
            .collect()
    }

    /// Return the committed fragments superseded by a consolidated fragment.
    #[must_use]
    pub fn superseded(&self) -> Vec<FragmentId> {
        self.committed
            .iter()
            .filter(|fragment| self.is_superseded(fragment))
            .copied()
            .collect()
    }

    fn is_superseded(&self, fragment: &FragmentId) -> bool {
        self.committed.iter().any(|other| other.covers(fragment))
    }

    /// Return the consolidated fragments with a vacuum file.
    #[must_use]
    pub fn vacuum_files(&self) -> &[FragmentId] {
        &self.vacuum
    }
}
