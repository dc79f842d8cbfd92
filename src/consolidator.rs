//! Fragment consolidation.
//!
//! A [`Consolidator`] merges a contiguous run of fragments into one new fragment and retires the originals:
//! ```text
//! Idle -> ReadingSources -> WritingMerged -> RetiringOld -> Idle
//! ```
//! 1. A [`ReadQuery`] over exactly the selected fragments and a [`WriteQuery`] for the new fragment are opened.
//! 2. Cells are copied in global order through one fixed-size [`CellBuffer`].
//! 3. The write query is finalized, which commits the new fragment. A vacuum file listing the superseded fragments is then written.
//! 4. The commit markers and directories of the superseded fragments are deleted and their cached metadata is invalidated.
//!
//! The new fragment covers the timestamp range of the fragments it replaces, so it supersedes them as soon as it is committed.
//! If retirement is interrupted the array is still read-equivalent, and [`Consolidator::vacuum`] completes the cleanup.

mod selection;

pub use selection::select_fragments;

use std::sync::Arc;

use derive_more::derive::Display;
use itertools::Itertools;
use parking_lot::Mutex;
use thiserror::Error;

use crate::{
    cache::BoundedLruCache,
    config::Config,
    fragment::{
        commit_uri, decode_vacuum_file, encode_vacuum_file, fragment_uri, vacuum_uri,
        FragmentError, FragmentId, FragmentInfo,
    },
    query::{CellBuffer, QueryError, QueryStatus, ReadQuery, WriteQuery},
    registry::{ArrayHandle, RegistryError},
    scheduler::IoScheduler,
    storage::{StorageError, StorageUri},
    task_pool::CancellationToken,
};

/// The state of a [`Consolidator`].
#[derive(Copy, Clone, Eq, PartialEq, Debug, Display)]
pub enum ConsolidationState {
    /// No consolidation is running.
    #[display("idle")]
    Idle,
    /// Copying cells from the source fragments.
    #[display("reading sources")]
    ReadingSources,
    /// Committing the merged fragment.
    #[display("writing merged")]
    WritingMerged,
    /// Deleting the superseded fragments.
    #[display("retiring old")]
    RetiringOld,
}

/// Why a consolidation was aborted.
#[derive(Debug, Error)]
pub enum AbortReason {
    /// A selected fragment is not committed.
    #[error("fragment {0} is not committed")]
    NotCommitted(FragmentId),
    /// A selected fragment has already been superseded by a consolidated fragment.
    #[error("fragment {0} has been superseded")]
    Superseded(FragmentId),
    /// The selected fragments are not contiguous in creation order.
    #[error("the selected fragments are not contiguous in creation order")]
    NotContiguous,
    /// Cancellation was requested.
    #[error("cancelled")]
    Cancelled,
    /// A query error.
    #[error(transparent)]
    Query(#[from] QueryError),
    /// A fragment error.
    #[error(transparent)]
    Fragment(#[from] FragmentError),
}

/// A consolidation error.
#[derive(Debug, Error)]
pub enum ConsolidationError {
    /// The consolidation failed before the new fragment was committed. Nothing changed.
    #[error("consolidation of {array} aborted: {reason}")]
    Aborted {
        /// The array URI.
        array: StorageUri,
        /// The cause.
        #[source]
        reason: AbortReason,
    },
    /// The new fragment was committed but some superseded fragments could not be deleted.
    ///
    /// The array is consistent. [`Consolidator::vacuum`] retries the cleanup.
    #[error("consolidated fragment {fragment} of {array} committed, but cleanup of {} superseded fragments failed: {source}", .remaining.len())]
    Partial {
        /// The array URI.
        array: StorageUri,
        /// The committed fragment.
        fragment: FragmentId,
        /// The superseded fragments that may still be present.
        remaining: Vec<FragmentId>,
        /// The first cleanup error.
        #[source]
        source: StorageError,
    },
    /// A registry error.
    #[error(transparent)]
    Registry(#[from] RegistryError),
    /// A fragment error.
    #[error(transparent)]
    Fragment(#[from] FragmentError),
    /// A storage error.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl ConsolidationError {
    /// Returns true if the error left the new fragment committed.
    #[must_use]
    pub fn is_partial(&self) -> bool {
        matches!(self, Self::Partial { .. })
    }
}

/// Consolidation parameters.
#[derive(Clone, Debug)]
pub struct ConsolidationConfig {
    buffer_size: usize,
    steps: u32,
    step_min_frags: u32,
    step_max_frags: u32,
    step_size_ratio: f32,
}

impl Default for ConsolidationConfig {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for ConsolidationConfig {
    fn from(config: &Config) -> Self {
        Self {
            buffer_size: usize::try_from(config.consolidation_buffer_size_bytes())
                .unwrap_or(usize::MAX),
            steps: config.consolidation_steps(),
            step_min_frags: config.consolidation_step_min_frags(),
            step_max_frags: config.consolidation_step_max_frags(),
            step_size_ratio: config.consolidation_step_size_ratio(),
        }
    }
}

impl ConsolidationConfig {
    /// Return the size in bytes of the copy buffer.
    #[must_use]
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Set the size in bytes of the copy buffer.
    pub fn set_buffer_size(&mut self, buffer_size: usize) -> &mut Self {
        self.buffer_size = buffer_size;
        self
    }

    /// Return the maximum number of steps run by [`Consolidator::consolidate_steps`].
    #[must_use]
    pub fn steps(&self) -> u32 {
        self.steps
    }

    /// Set the maximum number of steps run by [`Consolidator::consolidate_steps`].
    pub fn set_steps(&mut self, steps: u32) -> &mut Self {
        self.steps = steps;
        self
    }

    /// Return the minimum number of fragments consolidated in a step.
    #[must_use]
    pub fn step_min_frags(&self) -> u32 {
        self.step_min_frags
    }

    /// Set the minimum number of fragments consolidated in a step.
    pub fn set_step_min_frags(&mut self, step_min_frags: u32) -> &mut Self {
        self.step_min_frags = step_min_frags;
        self
    }

    /// Return the maximum number of fragments consolidated in a step.
    #[must_use]
    pub fn step_max_frags(&self) -> u32 {
        self.step_max_frags
    }

    /// Set the maximum number of fragments consolidated in a step.
    pub fn set_step_max_frags(&mut self, step_max_frags: u32) -> &mut Self {
        self.step_max_frags = step_max_frags;
        self
    }

    /// Return the minimum size ratio of adjacent fragments consolidated in a step.
    #[must_use]
    pub fn step_size_ratio(&self) -> f32 {
        self.step_size_ratio
    }

    /// Set the minimum size ratio of adjacent fragments consolidated in a step.
    pub fn set_step_size_ratio(&mut self, step_size_ratio: f32) -> &mut Self {
        self.step_size_ratio = step_size_ratio;
        self
    }
}

/// Merges fragments and retires the fragments it replaces.
///
/// Consolidations run by one consolidator are serialised.
#[derive(Debug)]
pub struct Consolidator {
    scheduler: IoScheduler,
    cache: Arc<BoundedLruCache>,
    config: ConsolidationConfig,
    state: Mutex<ConsolidationState>,
    running: Mutex<()>,
}

impl Consolidator {
    /// Create a new consolidator.
    #[must_use]
    pub fn new(
        scheduler: IoScheduler,
        cache: Arc<BoundedLruCache>,
        config: ConsolidationConfig,
    ) -> Self {
        Self {
            scheduler,
            cache,
            config,
            state: Mutex::new(ConsolidationState::Idle),
            running: Mutex::new(()),
        }
    }

    /// Return the consolidation parameters.
    #[must_use]
    pub fn config(&self) -> &ConsolidationConfig {
        &self.config
    }

    /// Return the current state.
    #[must_use]
    pub fn state(&self) -> ConsolidationState {
        *self.state.lock()
    }

    fn transition(&self, array: &StorageUri, state: ConsolidationState) {
        let mut current = self.state.lock();
        log::debug!("consolidation of {array}: {} -> {state}", *current);
        *current = state;
    }

    /// Consolidate `fragments` of the array of `handle` into one new fragment.
    ///
    /// `fragments` must be committed, visible, and contiguous in creation order (they are sorted first).
    /// Returns the new fragment, or [`None`] if fewer than two fragments are given.
    /// `cancel` is checked between copy batches.
    ///
    /// # Errors
    /// Returns [`ConsolidationError::Aborted`] if the consolidation fails before the new fragment is committed, in which case nothing visible has changed.
    /// Returns [`ConsolidationError::Partial`] if the new fragment was committed but a superseded fragment could not be deleted.
    pub fn consolidate(
        &self,
        handle: &ArrayHandle,
        fragments: &[FragmentId],
        cancel: &CancellationToken,
    ) -> Result<Option<FragmentId>, ConsolidationError> {
        let _running = self.running.lock();
        let array = handle.uri().clone();
        let mut fragments = fragments.to_vec();
        fragments.sort();
        fragments.dedup();
        let (Some(&first), Some(&last)) = (fragments.first(), fragments.last()) else {
            return Ok(None);
        };
        if first == last {
            return Ok(None);
        }
        let aborted = |reason: AbortReason| ConsolidationError::Aborted {
            array: array.clone(),
            reason,
        };

        let info = FragmentInfo::load(&self.scheduler, &array)
            .map_err(|err| aborted(err.into()))?;
        Self::validate_selection(&info, &fragments).map_err(aborted)?;

        // Copy
        self.transition(&array, ConsolidationState::ReadingSources);
        let fragment = FragmentId::new(first.t_start(), last.t_end());
        let result = self.copy(handle, &fragments, fragment, cancel);
        let mut write = match result {
            Ok(write) => write,
            Err(reason) => {
                self.transition(&array, ConsolidationState::Idle);
                return Err(aborted(reason));
            }
        };

        // Commit
        self.transition(&array, ConsolidationState::WritingMerged);
        match write.finalize() {
            Ok(Some(_)) => {}
            Ok(None) => {
                self.transition(&array, ConsolidationState::Idle);
                return Ok(None);
            }
            Err(err) => {
                self.transition(&array, ConsolidationState::Idle);
                return Err(aborted(err.into()));
            }
        }
        log::debug!(
            "consolidated {} fragments of {array} into {fragment}",
            fragments.len()
        );

        // Retire
        self.transition(&array, ConsolidationState::RetiringOld);
        let result = self.write_vacuum_file(&array, fragment, &fragments);
        let result = result.and_then(|()| self.retire(handle, &fragments));
        let result =
            result.and_then(|()| self.scheduler.delete(&vacuum_uri(&array, &fragment)?));
        self.transition(&array, ConsolidationState::Idle);
        match result {
            Ok(()) => Ok(Some(fragment)),
            Err(source) => {
                let info = FragmentInfo::load(&self.scheduler, &array);
                let remaining = fragments
                    .iter()
                    .filter(|old| info.as_ref().map_or(true, |info| info.is_committed(old)))
                    .copied()
                    .collect();
                log::warn!(
                    "consolidation of {array} committed {fragment}, but cleanup failed: {source}"
                );
                Err(ConsolidationError::Partial {
                    array,
                    fragment,
                    remaining,
                    source,
                })
            }
        }
    }

    fn validate_selection(info: &FragmentInfo, fragments: &[FragmentId]) -> Result<(), AbortReason> {
        if let Some(fragment) = fragments.iter().find(|fragment| !info.is_committed(fragment)) {
            return Err(AbortReason::NotCommitted(*fragment));
        }
        let visible = info.visible();
        let positions = fragments
            .iter()
            .map(|fragment| {
                visible
                    .iter()
                    .position(|visible| visible == fragment)
                    .ok_or(AbortReason::Superseded(*fragment))
            })
            .collect::<Result<Vec<_>, _>>()?;
        if positions
            .iter()
            .tuple_windows()
            .any(|(previous, next)| *next != previous + 1)
        {
            return Err(AbortReason::NotContiguous);
        }
        Ok(())
    }

    /// Copy the cells of `fragments` into a new unfinalized fragment.
    fn copy(
        &self,
        handle: &ArrayHandle,
        fragments: &[FragmentId],
        fragment: FragmentId,
        cancel: &CancellationToken,
    ) -> Result<WriteQuery, AbortReason> {
        let mut read = ReadQuery::new(
            handle,
            self.scheduler.clone(),
            self.cache.clone(),
            handle.schema().domain(),
            Some(fragments),
        )?;
        let mut write = WriteQuery::new(
            self.scheduler.clone(),
            handle.uri().clone(),
            handle.schema().clone(),
            fragment,
        );
        let mut buffer = CellBuffer::new(self.config.buffer_size);
        loop {
            if cancel.is_cancelled() {
                Self::abort_write(&mut write);
                return Err(AbortReason::Cancelled);
            }
            let status = read
                .submit(&mut buffer)
                .and_then(|status| write.submit(buffer.cells()).map(|()| status));
            match status {
                Ok(QueryStatus::Completed) => return Ok(write),
                Ok(_) => {}
                Err(err) => {
                    Self::abort_write(&mut write);
                    return Err(err.into());
                }
            }
        }
    }

    fn abort_write(write: &mut WriteQuery) {
        if let Err(err) = write.abort() {
            log::warn!(
                "failed to delete aborted consolidated fragment {}: {err}",
                write.fragment()
            );
        }
    }

    fn write_vacuum_file(
        &self,
        array: &StorageUri,
        fragment: FragmentId,
        fragments: &[FragmentId],
    ) -> Result<(), StorageError> {
        self.scheduler
            .write_at(&vacuum_uri(array, &fragment)?, 0, &encode_vacuum_file(fragments))
    }

    /// Delete `fragments`: commit marker first, then the fragment directory.
    fn retire(&self, handle: &ArrayHandle, fragments: &[FragmentId]) -> Result<(), StorageError> {
        for fragment in fragments {
            let array = handle.uri();
            self.scheduler.delete(&commit_uri(array, fragment)?)?;
            let directory = fragment_uri(array, fragment)?;
            self.scheduler.delete(&directory)?;
            handle.invalidate_fragment_metadata(fragment);
            self.cache.remove_prefix(&format!("{directory}/"));
            log::debug!("retired fragment {fragment} of {array}");
        }
        Ok(())
    }

    /// Select and consolidate fragments of the array of `handle` up to [`ConsolidationConfig::steps`] times.
    ///
    /// Each step selects fragments with [`select_fragments`] among the visible fragments.
    /// Stops early if no fragments qualify or `cancel` is set between steps.
    /// Returns the new fragments.
    ///
    /// # Errors
    /// Returns a [`ConsolidationError`] if a step fails. Earlier steps remain committed.
    pub fn consolidate_steps(
        &self,
        handle: &ArrayHandle,
        cancel: &CancellationToken,
    ) -> Result<Vec<FragmentId>, ConsolidationError> {
        let mut consolidated = Vec::new();
        for _ in 0..self.config.steps {
            if cancel.is_cancelled() {
                break;
            }
            let visible = FragmentInfo::load(&self.scheduler, handle.uri())?.visible();
            let sizes = visible
                .iter()
                .map(|fragment| {
                    let metadata = handle.fragment_metadata(fragment)?;
                    Ok((*fragment, metadata.data_size()))
                })
                .collect::<Result<Vec<_>, RegistryError>>()?;
            let Some(selected) = select_fragments(&sizes, &self.config) else {
                break;
            };
            match self.consolidate(handle, &selected, cancel)? {
                Some(fragment) => consolidated.push(fragment),
                None => break,
            }
        }
        Ok(consolidated)
    }

    /// Delete superseded fragments of the array of `handle`.
    ///
    /// Deletes the fragments listed in vacuum files and any committed fragment superseded by another, invalidates their cached metadata, then removes vacuum files with nothing left to delete.
    /// Returns the number of fragments deleted.
    ///
    /// # Errors
    /// Returns a [`ConsolidationError`] if the commit directory cannot be read or a deletion fails.
    pub fn vacuum(&self, handle: &ArrayHandle) -> Result<usize, ConsolidationError> {
        let _running = self.running.lock();
        let array = handle.uri();
        let info = FragmentInfo::load(&self.scheduler, array)?;
        let mut to_delete = info.superseded();
        for consolidated in info.vacuum_files() {
            if !info.is_committed(consolidated) {
                continue;
            }
            let listed = decode_vacuum_file(
                &self.scheduler.read_all(&vacuum_uri(array, consolidated)?)?,
            )?;
            to_delete.extend(listed.into_iter().filter(|fragment| fragment != consolidated));
        }
        to_delete.sort();
        to_delete.dedup();
        // Listed fragments may already be gone
        let deleted = to_delete
            .iter()
            .filter(|fragment| info.is_committed(fragment))
            .count();

        self.retire(handle, &to_delete)?;
        for consolidated in info.vacuum_files() {
            self.scheduler.delete(&vacuum_uri(array, consolidated)?)?;
        }
        if deleted > 0 {
            log::debug!("vacuumed {deleted} fragments of {array}");
        }
        Ok(deleted)
    }
}
