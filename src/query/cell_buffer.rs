use crate::fragment::Cell;

/// A bounded buffer of cells.
///
/// The buffer holds cells up to a total encoded size and is reused across [`ReadQuery::submit`](super::ReadQuery::submit) calls.
#[derive(Clone, Debug)]
pub struct CellBuffer {
    cells: Vec<Cell>,
    size: usize,
    capacity: usize,
}

impl CellBuffer {
    /// Create an empty buffer holding up to `capacity` bytes of encoded cells.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            cells: Vec::new(),
            size: 0,
            capacity,
        }
    }

    /// Create an empty buffer without a size limit.
    #[must_use]
    pub fn unbounded() -> Self {
        Self::new(usize::MAX)
    }

    /// Append `cell` if it fits, otherwise return it.
    ///
    /// # Errors
    /// Returns `cell` if appending it would exceed the capacity.
    pub fn try_push(&mut self, cell: Cell) -> Result<(), Cell> {
        let size = cell.encoded_size();
        match self.size.checked_add(size) {
            Some(new_size) if new_size <= self.capacity => {
                self.size = new_size;
                self.cells.push(cell);
                Ok(())
            }
            _ => Err(cell),
        }
    }

    /// Return the cells.
    #[must_use]
    pub fn cells(&self) -> &[Cell] {
        &self.cells
    }

    /// Take the cells, leaving the buffer empty.
    pub fn take(&mut self) -> Vec<Cell> {
        self.size = 0;
        std::mem::take(&mut self.cells)
    }

    /// Return the number of cells.
    #[must_use]
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    /// Returns true if the buffer holds no cells.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Return the encoded size of the cells in bytes.
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Return the capacity in bytes.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Remove all cells, keeping the allocation.
    pub fn clear(&mut self) {
        self.cells.clear();
        self.size = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cell_buffer() {
        let mut buffer = CellBuffer::new(30);
        assert!(buffer.try_push(Cell::new(1, &b"abc"[..])).is_ok());
        assert!(buffer.try_push(Cell::new(2, &b"abc"[..])).is_ok());
        let rejected = buffer.try_push(Cell::new(3, &b""[..])).unwrap_err();
        assert_eq!(rejected.coordinate(), 3);
        assert_eq!(buffer.len(), 2);
        assert_eq!(buffer.size(), 30);
        assert_eq!(buffer.take().len(), 2);
        assert!(buffer.is_empty());
        assert_eq!(buffer.size(), 0);
        assert!(buffer.try_push(Cell::new(3, &b""[..])).is_ok());
        buffer.clear();
        assert!(buffer.is_empty());
    }
}
