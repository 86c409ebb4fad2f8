use crate::dictionary::Dictionary;
use crate::error::QuarryError;
use crate::forward_index::ForwardIndex;
use crate::inverted_index::BitmapInvertedIndex;
use crate::metadata::{ColumnMetadata, ForwardIndexKind};

/// Everything a loaded segment knows about one column: metadata, dictionary, forward index
/// and (optionally) the inverted index.
#[derive(Debug)]
pub struct ColumnDataSource {
    metadata: ColumnMetadata,
    dictionary: Option<Dictionary>,
    forward: ForwardIndex,
    inverted: Option<BitmapInvertedIndex>,
}

impl ColumnDataSource {
    pub fn new(
        metadata: ColumnMetadata,
        dictionary: Option<Dictionary>,
        forward: ForwardIndex,
        inverted: Option<BitmapInvertedIndex>,
    ) -> Result<Self, QuarryError> {
        let kind_matches = matches!(
            (metadata.forward_index_kind(), &forward),
            (ForwardIndexKind::SingleValue, ForwardIndex::SingleValue(_))
                | (ForwardIndexKind::MultiValue, ForwardIndex::MultiValue(_))
                | (ForwardIndexKind::Raw, ForwardIndex::Raw(_))
        );
        if !kind_matches || dictionary.is_some() != metadata.has_dictionary {
            return Err(QuarryError::Internal(format!(
                "Column {} readers do not match its metadata",
                metadata.name
            )));
        }
        if forward.num_rows() != metadata.total_docs {
            return Err(QuarryError::CorruptSegment {
                details: format!(
                    "Column {} forward index has {} rows, metadata says {}",
                    metadata.name,
                    forward.num_rows(),
                    metadata.total_docs
                ),
                path: None,
            });
        }
        Ok(Self {
            metadata,
            dictionary,
            forward,
            inverted,
        })
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn metadata(&self) -> &ColumnMetadata {
        &self.metadata
    }

    pub fn total_docs(&self) -> u32 {
        self.metadata.total_docs
    }

    pub fn is_single_value(&self) -> bool {
        self.metadata.single_value
    }

    pub fn dictionary(&self) -> Option<&Dictionary> {
        self.dictionary.as_ref()
    }

    pub fn forward_index(&self) -> &ForwardIndex {
        &self.forward
    }

    pub fn inverted_index(&self) -> Option<&BitmapInvertedIndex> {
        self.inverted.as_ref()
    }
}
