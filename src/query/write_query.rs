use std::sync::Arc;

use crate::{
    fragment::{
        cells_uri, commit_uri, encode_cells, fragment_metadata_uri, fragment_uri, BlockMetadata,
        Cell, FragmentId, FragmentMetadata,
    },
    scheduler::IoScheduler,
    schema::ArraySchema,
    storage::StorageUri,
};

use super::{QueryError, QueryStatus};

/// A query writing one new fragment.
///
/// Cells must be submitted in strictly ascending coordinate order across all [`WriteQuery::submit`] calls.
/// The fragment is invisible to readers until [`WriteQuery::finalize`] writes its commit marker.
/// A query dropped without being finalized deletes what it has written.
#[derive(Debug)]
pub struct WriteQuery {
    scheduler: IoScheduler,
    array: StorageUri,
    schema: Arc<ArraySchema>,
    fragment: FragmentId,
    blocks: Vec<BlockMetadata>,
    offset: u64,
    last_coordinate: Option<u64>,
    status: QueryStatus,
}

impl WriteQuery {
    /// Create a write query for the new fragment `fragment` of `array`.
    #[must_use]
    pub fn new(
        scheduler: IoScheduler,
        array: StorageUri,
        schema: Arc<ArraySchema>,
        fragment: FragmentId,
    ) -> Self {
        Self {
            scheduler,
            array,
            schema,
            fragment,
            blocks: Vec::new(),
            offset: 0,
            last_coordinate: None,
            status: QueryStatus::InProgress,
        }
    }

    /// Return the id of the fragment being written.
    #[must_use]
    pub fn fragment(&self) -> &FragmentId {
        &self.fragment
    }

    /// Return the query status.
    #[must_use]
    pub fn status(&self) -> QueryStatus {
        self.status
    }

    /// Return the number of cells written so far.
    #[must_use]
    pub fn cell_count(&self) -> u64 {
        self.blocks.iter().map(BlockMetadata::cell_count).sum()
    }

    /// Append `cells` to the fragment.
    ///
    /// The cells are validated, encoded in blocks of at most the schema capacity and written through the scheduler.
    ///
    /// # Errors
    /// Returns [`QueryError::OutOfDomain`] or [`QueryError::Unordered`] for an invalid cell (nothing from the call is written), [`QueryError::InvalidStatus`] if the query is not in progress, or another [`QueryError`] if a write fails.
    /// A failed write fails the query; it must then be aborted.
    pub fn submit(&mut self, cells: &[Cell]) -> Result<(), QueryError> {
        if self.status != QueryStatus::InProgress {
            return Err(QueryError::InvalidStatus(self.status));
        }
        let mut previous = self.last_coordinate;
        for cell in cells {
            let coordinate = cell.coordinate();
            if !self.schema.contains(coordinate) {
                return Err(QueryError::OutOfDomain {
                    coordinate,
                    domain: self.schema.domain(),
                });
            }
            if let Some(previous) = previous.filter(|&previous| previous >= coordinate) {
                return Err(QueryError::Unordered {
                    previous,
                    coordinate,
                });
            }
            previous = Some(coordinate);
        }

        let capacity = usize::try_from(self.schema.capacity()).unwrap_or(usize::MAX);
        for block in cells.chunks(capacity) {
            if let Err(err) = self.write_block(block) {
                self.status = QueryStatus::Failed;
                return Err(err);
            }
        }
        self.last_coordinate = previous;
        Ok(())
    }

    fn write_block(&mut self, cells: &[Cell]) -> Result<(), QueryError> {
        let (Some(first), Some(last)) = (cells.first(), cells.last()) else {
            return Ok(());
        };
        let encoded = encode_cells(cells)?;
        let uri = cells_uri(&self.array, &self.fragment)?;
        self.scheduler.write_at(&uri, self.offset, &encoded)?;
        let size = encoded.len() as u64;
        self.blocks.push(BlockMetadata::new(
            self.offset,
            size,
            cells.len() as u64,
            first.coordinate(),
            last.coordinate(),
        ));
        self.offset += size;
        Ok(())
    }

    /// Commit the fragment: write its metadata, then its commit marker.
    ///
    /// Returns the committed fragment, or [`None`] if no cells were written (nothing is committed).
    ///
    /// # Errors
    /// Returns [`QueryError::InvalidStatus`] if the query is not in progress, or another [`QueryError`] if the fragment cannot be committed.
    /// A failed finalize aborts the query, so the fragment never becomes visible.
    pub fn finalize(&mut self) -> Result<Option<FragmentId>, QueryError> {
        if self.status != QueryStatus::InProgress {
            return Err(QueryError::InvalidStatus(self.status));
        }
        if self.blocks.is_empty() {
            self.status = QueryStatus::Completed;
            return Ok(None);
        }
        match self.commit() {
            Ok(()) => {
                self.status = QueryStatus::Completed;
                log::debug!("committed fragment {} of {}", self.fragment, self.array);
                Ok(Some(self.fragment))
            }
            Err(err) => {
                self.status = QueryStatus::Failed;
                if let Err(abort_err) = self.abort() {
                    log::warn!(
                        "failed to delete uncommitted fragment {} of {}: {abort_err}",
                        self.fragment,
                        self.array
                    );
                }
                Err(err)
            }
        }
    }

    fn commit(&self) -> Result<(), QueryError> {
        let metadata = FragmentMetadata::new(self.fragment, self.blocks.clone())?;
        self.scheduler.write_at(
            &fragment_metadata_uri(&self.array, &self.fragment)?,
            0,
            &metadata.to_json()?,
        )?;
        self.scheduler
            .write_at(&commit_uri(&self.array, &self.fragment)?, 0, &[])?;
        Ok(())
    }

    /// Delete everything written by the query.
    ///
    /// # Errors
    /// Returns [`QueryError::InvalidStatus`] if the query has been finalized, or a [`QueryError`] if deletion fails.
    pub fn abort(&mut self) -> Result<(), QueryError> {
        if self.status == QueryStatus::Completed {
            return Err(QueryError::InvalidStatus(self.status));
        }
        if self.status == QueryStatus::Aborted {
            return Ok(());
        }
        self.scheduler
            .delete(&commit_uri(&self.array, &self.fragment)?)?;
        self.scheduler
            .delete(&fragment_uri(&self.array, &self.fragment)?)?;
        self.status = QueryStatus::Aborted;
        Ok(())
    }
}

impl Drop for WriteQuery {
    fn drop(&mut self) {
        let written = match self.status {
            QueryStatus::InProgress => !self.blocks.is_empty(),
            QueryStatus::Failed => true,
            _ => false,
        };
        if written {
            if let Err(err) = self.abort() {
                log::warn!(
                    "failed to delete unfinalized fragment {} of {}: {err}",
                    self.fragment,
                    self.array
                );
            }
        }
    }
}
