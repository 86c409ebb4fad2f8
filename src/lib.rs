#![doc = include_str!("../README.md")]
// Declare modules
pub mod aggregation;
pub mod bitpack;
pub mod block;
pub mod buffer;
pub mod core;
pub mod creator;
pub mod datasource;
pub mod dictionary;
pub mod encoding;
pub mod error;
pub mod filter;
pub mod forward_index;
pub mod groupby;
pub mod inverted_index;
pub mod loader;
pub mod metadata;
pub mod query;
pub mod record_reader;
pub mod stats;
pub mod telemetry;
pub mod types;

/// Aggregation functions and their mergeable partials.
pub use crate::aggregation::{AggregationFunction, AggregationSpec, FinalValue, IntermediateResult};
/// How segment files are brought into memory.
pub use crate::buffer::ReadMode;
/// Configuration options for the engine facade.
pub use crate::core::EngineConfig;
/// Main entry point: builds, loads and queries segments of a data directory.
pub use crate::core::Engine;
/// Segment creation driver and its configuration.
pub use crate::creator::{create_segment, BuildState, SegmentCreationDriver, SegmentGeneratorConfig};
/// Per-chunk compression of raw forward indexes.
pub use crate::encoding::BlockCompression;
/// Error type for segment storage, creation and queries.
pub use crate::error::QuarryError;
/// Filter trees.
pub use crate::filter::{FilterNode, Predicate};
/// Group-by ordering.
pub use crate::groupby::OrderBy;
/// Loading sealed segments.
pub use crate::loader::{load, load_with_options, ImmutableSegment, LoadOptions};
/// Query requests and results.
pub use crate::query::{execute_segment, GroupBySpec, QueryConfig, QueryExecutor, QueryRequest, ReducedResult};
/// Row producers for segment creation.
pub use crate::record_reader::{open_record_reader, InMemoryRecordReader, InputFormat, RecordReader};
/// Structured event hook for observability.
pub use crate::telemetry::{SegmentEvent, SegmentEventListener};
/// Column types, schemas and input rows.
pub use crate::types::{DataType, FieldSpec, FieldType, GenericRow, RowValue, Schema, Value};
