use serde::{Deserialize, Serialize};

use super::{FragmentError, FragmentId};

const FRAGMENT_METADATA_VERSION: u32 = 1;

/// The location and coordinate range of one block of cells in a fragment data file.
#[derive(Serialize, Deserialize, Clone, Copy, Eq, PartialEq, Debug)]
#[serde(deny_unknown_fields)]
pub struct BlockMetadata {
    offset: u64,
    size: u64,
    cell_count: u64,
    first: u64,
    last: u64,
}

impl BlockMetadata {
    /// Create block metadata.
    #[must_use]
    pub fn new(offset: u64, size: u64, cell_count: u64, first: u64, last: u64) -> Self {
        Self {
            offset,
            size,
            cell_count,
            first,
            last,
        }
    }

    /// Return the offset of the block in the data file.
    #[must_use]
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Return the encoded size of the block in bytes.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Return the number of cells in the block.
    #[must_use]
    pub fn cell_count(&self) -> u64 {
        self.cell_count
    }

    /// Return the first coordinate in the block.
    #[must_use]
    pub fn first(&self) -> u64 {
        self.first
    }

    /// Return the last coordinate in the block.
    #[must_use]
    pub fn last(&self) -> u64 {
        self.last
    }

    /// Returns true if the block may hold cells in the inclusive range `[start, end]`.
    #[must_use]
    pub fn overlaps(&self, start: u64, end: u64) -> bool {
        self.first <= end && start <= self.last
    }
}

/// The metadata of a committed fragment.
///
/// Written once when the fragment is finalized, immutable afterwards.
#[derive(Serialize, Deserialize, Clone, Eq, PartialEq, Debug)]
#[serde(deny_unknown_fields)]
pub struct FragmentMetadata {
    version: u32,
    fragment: FragmentId,
    non_empty_domain: [u64; 2],
    cell_count: u64,
    blocks: Vec<BlockMetadata>,
}

impl FragmentMetadata {
    /// Create the metadata of fragment `fragment` made of `blocks`.
    ///
    /// # Errors
    /// Returns [`FragmentError::InvalidMetadata`] if `blocks` is empty, the blocks are not contiguous in the data file, or the coordinates of the blocks are not strictly increasing.
    pub fn new(fragment: FragmentId, blocks: Vec<BlockMetadata>) -> Result<Self, FragmentError> {
        let (Some(first), Some(last)) = (blocks.first(), blocks.last()) else {
            return Err(FragmentError::InvalidMetadata(format!(
                "fragment {fragment} has no blocks"
            )));
        };
        let metadata = Self {
            version: FRAGMENT_METADATA_VERSION,
            fragment,
            non_empty_domain: [first.first, last.last],
            cell_count: blocks.iter().map(BlockMetadata::cell_count).sum(),
            blocks,
        };
        metadata.validate()?;
        Ok(metadata)
    }

    fn validate(&self) -> Result<(), FragmentError> {
        let invalid = |reason: &str| {
            Err(FragmentError::InvalidMetadata(format!(
                "fragment {}: {reason}",
                self.fragment
            )))
        };
        if self.version != FRAGMENT_METADATA_VERSION {
            return invalid("unsupported version");
        }
        if self.blocks.is_empty() {
            return invalid("no blocks");
        }
        let mut offset = 0;
        let mut previous_last: Option<u64> = None;
        for block in &self.blocks {
            if block.offset != offset {
                return invalid("blocks are not contiguous");
            }
            if block.cell_count == 0 || block.first > block.last {
                return invalid("empty block");
            }
            if previous_last.is_some_and(|last| last >= block.first) {
                return invalid("block coordinates are not increasing");
            }
            offset += block.size;
            previous_last = Some(block.last);
        }
        if self.non_empty_domain != [self.blocks[0].first, self.blocks[self.blocks.len() - 1].last]
        {
            return invalid("non-empty domain does not match blocks");
        }
        if self.cell_count != self.blocks.iter().map(BlockMetadata::cell_count).sum::<u64>() {
            return invalid("cell count does not match blocks");
        }
        Ok(())
    }

    /// Return the fragment id.
    #[must_use]
    pub fn fragment(&self) -> &FragmentId {
        &self.fragment
    }

    /// Return the inclusive range of coordinates in the fragment.
    #[must_use]
    pub fn non_empty_domain(&self) -> [u64; 2] {
        self.non_empty_domain
    }

    /// Return the number of cells in the fragment.
    #[must_use]
    pub fn cell_count(&self) -> u64 {
        self.cell_count
    }

    /// Return the blocks of the fragment, in coordinate order.
    #[must_use]
    pub fn blocks(&self) -> &[BlockMetadata] {
        &self.blocks
    }

    /// Return the size of the fragment data file in bytes.
    #[must_use]
    pub fn data_size(&self) -> u64 {
        self.blocks.iter().map(BlockMetadata::size).sum()
    }

    /// Serialise the metadata to JSON.
    ///
    /// # Errors
    /// Returns [`FragmentError::InvalidJson`] if serialisation fails.
    pub fn to_json(&self) -> Result<Vec<u8>, FragmentError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Deserialise and validate fragment metadata from JSON.
    ///
    /// # Errors
    /// Returns [`FragmentError::InvalidJson`] or [`FragmentError::InvalidMetadata`] if `json` is not valid fragment metadata.
    pub fn from_json(json: &[u8]) -> Result<Self, FragmentError> {
        let metadata: Self = serde_json::from_slice(json)?;
        metadata.validate()?;
        Ok(metadata)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fragment_metadata() {
        let id = FragmentId::new(1, 1);
        let metadata = FragmentMetadata::new(
            id,
            vec![
                BlockMetadata::new(0, 30, 2, 1, 5),
                BlockMetadata::new(30, 20, 1, 9, 9),
            ],
        )
        .unwrap();
        assert_eq!(metadata.fragment(), &id);
        assert_eq!(metadata.non_empty_domain(), [1, 9]);
        assert_eq!(metadata.cell_count(), 3);
        assert_eq!(metadata.data_size(), 50);
        assert!(metadata.blocks()[0].overlaps(5, 8));
        assert!(!metadata.blocks()[0].overlaps(6, 8));

        let json = metadata.to_json().unwrap();
        assert_eq!(FragmentMetadata::from_json(&json).unwrap(), metadata);
    }

    #[test]
    fn fragment_metadata_invalid() {
        let id = FragmentId::new(1, 1);
        assert!(FragmentMetadata::new(id, vec![]).is_err());
        assert!(FragmentMetadata::new(id, vec![BlockMetadata::new(4, 30, 2, 1, 5)]).is_err());
        assert!(FragmentMetadata::new(
            id,
            vec![
                BlockMetadata::new(0, 30, 2, 1, 5),
                BlockMetadata::new(30, 20, 1, 5, 9),
            ],
        )
        .is_err());
        assert!(matches!(
            FragmentMetadata::from_json(b"{}"),
            Err(FragmentError::InvalidJson(_))
        ));
    }
}
