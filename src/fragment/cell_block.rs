//! The encoding of a block of cells in a fragment data file.
//!
//! A block is a sequence of cells, each encoded as
//! ```text
//! coordinate: u64 (little endian) | value length: u32 (little endian) | value bytes
//! ```

use bytes::{Buf, BufMut, Bytes};

use super::FragmentError;

const CELL_HEADER_SIZE: usize = 12;

/// A cell: a coordinate and its attribute value.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct Cell {
    coordinate: u64,
    value: Bytes,
}

impl Cell {
    /// Create a new cell.
    #[must_use]
    pub fn new(coordinate: u64, value: impl Into<Bytes>) -> Self {
        Self {
            coordinate,
            value: value.into(),
        }
    }

    /// Return the coordinate.
    #[must_use]
    pub fn coordinate(&self) -> u64 {
        self.coordinate
    }

    /// Return the attribute value.
    #[must_use]
    pub fn value(&self) -> &Bytes {
        &self.value
    }

    /// Return the encoded size of the cell in bytes.
    #[must_use]
    pub fn encoded_size(&self) -> usize {
        CELL_HEADER_SIZE + self.value.len()
    }

    /// Consume the cell, returning its coordinate and value.
    #[must_use]
    pub fn into_parts(self) -> (u64, Bytes) {
        (self.coordinate, self.value)
    }
}

/// Encode `cells` as a block.
///
/// # Errors
/// Returns [`FragmentError::CellTooLarge`] if a value is longer than [`u32::MAX`] bytes.
pub fn encode_cells(cells: &[Cell]) -> Result<Vec<u8>, FragmentError> {
    let size = cells.iter().map(Cell::encoded_size).sum();
    let mut block = Vec::with_capacity(size);
    for cell in cells {
        let length = u32::try_from(cell.value.len())
            .map_err(|_| FragmentError::CellTooLarge(cell.coordinate))?;
        block.put_u64_le(cell.coordinate);
        block.put_u32_le(length);
        block.put_slice(&cell.value);
    }
    Ok(block)
}

/// Decode a block of cells.
///
/// Values are zero-copy slices of `block`.
///
/// # Errors
/// Returns [`FragmentError::CorruptBlock`] if `block` is truncated.
pub fn decode_cells(block: &Bytes) -> Result<Vec<Cell>, FragmentError> {
    let mut cells = Vec::new();
    let mut remaining = block.clone();
    while remaining.has_remaining() {
        if remaining.remaining() < CELL_HEADER_SIZE {
            return Err(FragmentError::CorruptBlock(format!(
                "truncated cell header at byte {}",
                block.len() - remaining.remaining()
            )));
        }
        let coordinate = remaining.get_u64_le();
        let length = remaining.get_u32_le() as usize;
        if remaining.remaining() < length {
            return Err(FragmentError::CorruptBlock(format!(
                "cell {coordinate} has {length} value bytes but {} remain",
                remaining.remaining()
            )));
        }
        cells.push(Cell {
            coordinate,
            value: remaining.split_to(length),
        });
    }
    Ok(cells)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cell_block() {
        let cells = vec![
            Cell::new(1, &b"one"[..]),
            Cell::new(2, Bytes::new()),
            Cell::new(u64::MAX, vec![7u8; 300]),
        ];
        let block = encode_cells(&cells).unwrap();
        assert_eq!(
            block.len(),
            cells.iter().map(Cell::encoded_size).sum::<usize>()
        );
        assert_eq!(&block[..12], &[1, 0, 0, 0, 0, 0, 0, 0, 3, 0, 0, 0]);
        let block = Bytes::from(block);
        assert_eq!(decode_cells(&block).unwrap(), cells);
        assert!(decode_cells(&Bytes::new()).unwrap().is_empty());
    }

    #[test]
    fn cell_block_corrupt() {
        let block = Bytes::from(encode_cells(&[Cell::new(1, &b"one"[..])]).unwrap());
        assert!(matches!(
            decode_cells(&block.slice(..14)),
            Err(FragmentError::CorruptBlock(_))
        ));
        assert!(matches!(
            decode_cells(&block.slice(..5)),
            Err(FragmentError::CorruptBlock(_))
        ));
    }
}
