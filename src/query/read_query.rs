use std::{collections::VecDeque, sync::Arc};

use bytes::Bytes;

use crate::{
    cache::BoundedLruCache,
    fragment::{cells_uri, decode_cells, BlockMetadata, Cell, FragmentId, FragmentInfo},
    registry::{ArrayHandle, FragmentMetadataRef},
    scheduler::IoScheduler,
    storage::{StorageError, StorageUri},
};

use super::{CellBuffer, QueryError, QueryStatus};

/// The read position in one fragment.
#[derive(Debug)]
struct FragmentCursor {
    metadata: FragmentMetadataRef,
    cells_uri: StorageUri,
    next_block: usize,
    cells: VecDeque<Cell>,
}

/// A query reading the cells in a coordinate range.
///
/// Results are delivered in global order.
/// When fragments hold the same coordinate, the cell of the most recently created fragment is returned.
#[derive(Debug)]
pub struct ReadQuery {
    scheduler: IoScheduler,
    cache: Arc<BoundedLruCache>,
    range: [u64; 2],
    cursors: Vec<FragmentCursor>,
    pending: Option<Cell>,
    status: QueryStatus,
}

impl ReadQuery {
    /// Create a query reading cells with coordinates in the inclusive `range` of the array of `handle`.
    ///
    /// If `fragments` is [`None`] the visible fragments of the array are read (see [`FragmentInfo::visible`]).
    /// Otherwise exactly the listed fragments are read, in creation order.
    /// The metadata of every fragment is fetched up front and held until the query is dropped.
    ///
    /// # Errors
    /// Returns [`QueryError::InvalidRange`] if `range` is empty, or another [`QueryError`] if the fragments cannot be listed or their metadata cannot be fetched.
    pub fn new(
        handle: &ArrayHandle,
        scheduler: IoScheduler,
        cache: Arc<BoundedLruCache>,
        range: [u64; 2],
        fragments: Option<&[FragmentId]>,
    ) -> Result<Self, QueryError> {
        if range[0] > range[1] {
            return Err(QueryError::InvalidRange(range));
        }
        let mut fragments = match fragments {
            Some(fragments) => fragments.to_vec(),
            None => FragmentInfo::load(&scheduler, handle.uri())?.visible(),
        };
        fragments.sort();
        fragments.dedup();

        let cursors = fragments
            .iter()
            .map(|fragment| {
                let metadata = handle.fragment_metadata(fragment)?;
                let next_block = metadata
                    .blocks()
                    .partition_point(|block| block.last() < range[0]);
                Ok(FragmentCursor {
                    metadata,
                    cells_uri: cells_uri(handle.uri(), fragment)?,
                    next_block,
                    cells: VecDeque::new(),
                })
            })
            .collect::<Result<Vec<_>, QueryError>>()?;

        Ok(Self {
            scheduler,
            cache,
            range,
            cursors,
            pending: None,
            status: QueryStatus::Incomplete,
        })
    }

    /// Return the query status.
    #[must_use]
    pub fn status(&self) -> QueryStatus {
        self.status
    }

    /// Return the fragments read by the query, in creation order.
    #[must_use]
    pub fn fragments(&self) -> Vec<FragmentId> {
        self.cursors
            .iter()
            .map(|cursor| *cursor.metadata.fragment())
            .collect()
    }

    /// Fill `buffer` with the next results.
    ///
    /// `buffer` is cleared first.
    /// Returns [`QueryStatus::Incomplete`] if `buffer` filled up before all results were delivered, or [`QueryStatus::Completed`] otherwise.
    ///
    /// # Errors
    /// Returns [`QueryError::BufferTooSmall`] if the next cell does not fit in the empty buffer, [`QueryError::InvalidStatus`] if the query has already completed or failed, or another [`QueryError`] if a read fails (the query is then failed).
    pub fn submit(&mut self, buffer: &mut CellBuffer) -> Result<QueryStatus, QueryError> {
        if self.status != QueryStatus::Incomplete {
            return Err(QueryError::InvalidStatus(self.status));
        }
        buffer.clear();
        loop {
            let cell = match self.pending.take() {
                Some(cell) => cell,
                None => match self.next_cell() {
                    Ok(Some(cell)) => cell,
                    Ok(None) => {
                        self.status = QueryStatus::Completed;
                        return Ok(self.status);
                    }
                    Err(err) => {
                        self.status = QueryStatus::Failed;
                        return Err(err);
                    }
                },
            };
            if let Err(cell) = buffer.try_push(cell) {
                if buffer.is_empty() {
                    let err = QueryError::BufferTooSmall {
                        cell_size: cell.encoded_size(),
                        capacity: buffer.capacity(),
                    };
                    self.pending = Some(cell);
                    return Err(err);
                }
                self.pending = Some(cell);
                return Ok(QueryStatus::Incomplete);
            }
        }
    }

    /// Read all remaining results.
    ///
    /// # Errors
    /// See [`ReadQuery::submit`].
    pub fn read_all(&mut self) -> Result<Vec<Cell>, QueryError> {
        let mut buffer = CellBuffer::unbounded();
        self.submit(&mut buffer)?;
        Ok(buffer.take())
    }

    /// Return the next merged cell.
    fn next_cell(&mut self) -> Result<Option<Cell>, QueryError> {
        let mut next: Option<(u64, usize)> = None;
        for index in 0..self.cursors.len() {
            if let Some(coordinate) = self.peek(index)? {
                // Later fragments win ties
                if next.map_or(true, |(min, _)| coordinate <= min) {
                    next = Some((coordinate, index));
                }
            }
        }
        let Some((coordinate, winner)) = next else {
            return Ok(None);
        };
        let mut result = None;
        for (index, cursor) in self.cursors.iter_mut().enumerate() {
            if cursor.cells.front().map(Cell::coordinate) == Some(coordinate) {
                let cell = cursor.cells.pop_front();
                if index == winner {
                    result = cell;
                }
            }
        }
        Ok(result)
    }

    /// Return the coordinate of the next cell of fragment `index`, loading blocks as required.
    fn peek(&mut self, index: usize) -> Result<Option<u64>, QueryError> {
        let range = self.range;
        loop {
            let cursor = &mut self.cursors[index];
            if let Some(cell) = cursor.cells.front() {
                return Ok(Some(cell.coordinate()));
            }
            let Some(block) = cursor.metadata.blocks().get(cursor.next_block).copied() else {
                return Ok(None);
            };
            if block.first() > range[1] {
                cursor.next_block = cursor.metadata.blocks().len();
                return Ok(None);
            }
            cursor.next_block += 1;
            let block = self.read_block(&self.cursors[index].cells_uri, &block)?;
            self.cursors[index].cells = decode_cells(&block)?
                .into_iter()
                .filter(|cell| (range[0]..=range[1]).contains(&cell.coordinate()))
                .collect();
        }
    }

    /// Read a block through the tile cache.
    fn read_block(&self, uri: &StorageUri, block: &BlockMetadata) -> Result<Bytes, QueryError> {
        let key = format!("{uri}@{}", block.offset());
        let size = usize::try_from(block.size()).map_err(|_| {
            QueryError::Storage(StorageError::Other(format!("block {key} is too large")))
        })?;
        let mut data = vec![0; size];
        if !self.cache.read(&key, &mut data, 0)? {
            self.scheduler.read(uri, block.offset(), &mut data)?;
            let data = Bytes::from(data);
            self.cache.insert(key, data.clone());
            return Ok(data);
        }
        Ok(Bytes::from(data))
    }
}
