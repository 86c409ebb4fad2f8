//! Segment creation: two passes over a [`RecordReader`] and an atomic publish.
//!
//! The driver moves strictly through `Init → StatsCollection → IndexBuild → Seal → Done`.
//! Every file is written into a temporary directory next to the output directory. Only after
//! `metadata.bin` and `creation.meta` are on disk and synced is that directory renamed to
//! the final segment name, so a failure at any stage leaves nothing under the final path.

use crate::bitpack::bits_for_cardinality;
use crate::dictionary::Dictionary;
use crate::encoding::BlockCompression;
use crate::error::QuarryError;
use crate::forward_index::{MultiValueForwardIndexCreator, RawForwardIndexCreator, SingleValueForwardIndexCreator};
use crate::inverted_index::InvertedIndexCreator;
use crate::metadata::{
    compute_segment_crc, dictionary_file_name, encode_metadata, forward_index_file_name, inverted_index_file_name,
    sync_dir, sync_parent_dir, write_file_synced, ColumnMetadata, CreationMeta, ForwardIndexKind, SegmentMetadata,
    CREATION_META_FILE, METADATA_FILE, SEGMENT_FORMAT_VERSION,
};
use crate::record_reader::RecordReader;
use crate::stats::{normalize, ColumnStatistics, SegmentStatsCollector};
use crate::telemetry::{noop_event_listener, quarry_metrics, SegmentEvent, SegmentEventListener};
use crate::types::{FieldSpec, Schema, Value};

use std::fmt;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Docs per compressed chunk of a raw forward index.
pub const DEFAULT_RAW_DOCS_PER_CHUNK: u32 = 1000;

const TEMP_DIR_PREFIX: &str = ".quarry-build-";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BuildState {
    Init,
    StatsCollection,
    IndexBuild,
    Seal,
    Done,
}

impl fmt::Display for BuildState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BuildState::Init => "init",
            BuildState::StatsCollection => "stats collection",
            BuildState::IndexBuild => "index build",
            BuildState::Seal => "seal",
            BuildState::Done => "done",
        })
    }
}

/// Configuration for building one segment.
#[derive(Debug, Clone)]
pub struct SegmentGeneratorConfig {
    pub table_name: String,
    /// Directory the sealed segment directory is published into.
    pub out_dir: PathBuf,
    /// Explicit segment name; derived from the table and time range when unset.
    pub segment_name: Option<String>,
    pub segment_name_postfix: Option<String>,
    pub inverted_index_columns: Vec<String>,
    /// Columns stored as raw values without a dictionary. Numeric single-value columns only.
    pub no_dictionary_columns: Vec<String>,
    pub raw_compression: BlockCompression,
    pub raw_docs_per_chunk: u32,
    pub event_listener: Arc<dyn SegmentEventListener>,
}

impl Default for SegmentGeneratorConfig {
    fn default() -> Self {
        Self {
            table_name: "default".to_string(),
            out_dir: PathBuf::from("./data"),
            segment_name: None,
            segment_name_postfix: None,
            inverted_index_columns: Vec::new(),
            no_dictionary_columns: Vec::new(),
            raw_compression: BlockCompression::default(),
            raw_docs_per_chunk: DEFAULT_RAW_DOCS_PER_CHUNK,
            event_listener: noop_event_listener(),
        }
    }
}

impl SegmentGeneratorConfig {
    pub fn new(table_name: &str, out_dir: impl Into<PathBuf>) -> Self {
        Self {
            table_name: table_name.to_string(),
            out_dir: out_dir.into(),
            ..Self::default()
        }
    }

    fn validate(&self, schema: &Schema) -> Result<(), QuarryError> {
        schema.validate()?;
        if self.table_name.is_empty() || self.table_name.contains(['/', '\\']) {
            return Err(QuarryError::ConfigError(format!("invalid table name {:?}", self.table_name)));
        }
        for name in self.inverted_index_columns.iter().chain(&self.no_dictionary_columns) {
            if schema.field(name).is_none() {
                return Err(QuarryError::ConfigError(format!("column {} is not in the schema", name)));
            }
        }
        for name in &self.no_dictionary_columns {
            if self.inverted_index_columns.contains(name) {
                return Err(QuarryError::ConfigError(format!(
                    "column {} cannot have an inverted index without a dictionary",
                    name
                )));
            }
            if let Some(field) = schema.field(name) {
                if !field.single_value || !field.data_type.is_numeric() {
                    return Err(QuarryError::ConfigError(format!(
                        "raw column {} must be numeric and single-valued",
                        name
                    )));
                }
            }
        }
        if self.raw_docs_per_chunk == 0 {
            return Err(QuarryError::ConfigError("raw_docs_per_chunk must be positive".to_string()));
        }
        Ok(())
    }
}

/// Where and what a successful build published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentBuildOutcome {
    pub name: String,
    pub path: PathBuf,
    pub total_docs: u32,
    pub crc: u32,
}

enum ForwardCreator {
    SingleValue(SingleValueForwardIndexCreator),
    MultiValue(MultiValueForwardIndexCreator),
    Raw(RawForwardIndexCreator),
}

struct ColumnCreator {
    field: FieldSpec,
    stats: ColumnStatistics,
    dictionary: Option<Dictionary>,
    forward: ForwardCreator,
    inverted: Option<InvertedIndexCreator>,
    compression: Option<BlockCompression>,
    ids: Vec<u32>,
}

impl ColumnCreator {
    fn new(field: &FieldSpec, stats: ColumnStatistics, config: &SegmentGeneratorConfig) -> Result<Self, QuarryError> {
        let total_docs = stats.total_docs;
        if config.no_dictionary_columns.contains(&field.name) {
            let forward = RawForwardIndexCreator::new(
                field.data_type,
                total_docs,
                config.raw_docs_per_chunk,
                config.raw_compression,
            )?;
            return Ok(Self {
                field: field.clone(),
                stats,
                dictionary: None,
                forward: ForwardCreator::Raw(forward),
                inverted: None,
                compression: Some(config.raw_compression),
                ids: Vec::new(),
            });
        }

        let dictionary = Dictionary::from_sorted_values(field.data_type, &stats.sorted_uniques)?;
        let cardinality = dictionary.len();
        let forward = if field.single_value {
            ForwardCreator::SingleValue(SingleValueForwardIndexCreator::new(total_docs, cardinality)?)
        } else {
            ForwardCreator::MultiValue(MultiValueForwardIndexCreator::new(
                total_docs,
                stats.total_number_of_entries as usize,
                cardinality,
            ))
        };
        let inverted = config
            .inverted_index_columns
            .contains(&field.name)
            .then(|| InvertedIndexCreator::new(cardinality));
        Ok(Self {
            field: field.clone(),
            stats,
            dictionary: Some(dictionary),
            forward,
            inverted,
            compression: None,
            ids: Vec::new(),
        })
    }

    fn index(&mut self, row: u32, values: &[Value]) -> Result<(), QuarryError> {
        let Some(dictionary) = &self.dictionary else {
            return match (&mut self.forward, values.first()) {
                (ForwardCreator::Raw(raw), Some(v)) => raw.index(row, v),
                _ => Err(QuarryError::Internal(format!("raw column {} lost its values", self.field.name))),
            };
        };
        self.ids.clear();
        for v in values {
            let id = dictionary.index_of(v).ok_or_else(|| QuarryError::InvalidValue {
                column: self.field.name.clone(),
                details: format!("{} was not seen while collecting statistics", v),
            })?;
            self.ids.push(id);
        }
        match &mut self.forward {
            ForwardCreator::SingleValue(sv) => sv.index(row, self.ids[0])?,
            ForwardCreator::MultiValue(mv) => mv.index(row, &self.ids)?,
            ForwardCreator::Raw(_) => {}
        }
        if let Some(inv) = &mut self.inverted {
            inv.add_multi(row, &self.ids)?;
        }
        Ok(())
    }

    /// Writes the column's files into `dir` and returns its metadata.
    fn seal(self, dir: &Path) -> Result<ColumnMetadata, QuarryError> {
        let name = &self.field.name;
        let has_inverted_index = self.inverted.is_some();
        let bits_per_element = match self.forward {
            ForwardCreator::SingleValue(sv) => {
                write_file_synced(&dir.join(forward_index_file_name(name, ForwardIndexKind::SingleValue)), &sv.seal())?;
                bits_for_cardinality(self.stats.cardinality())
            }
            ForwardCreator::MultiValue(mv) => {
                let bits = mv.bits();
                write_file_synced(&dir.join(forward_index_file_name(name, ForwardIndexKind::MultiValue)), &mv.seal()?)?;
                bits
            }
            ForwardCreator::Raw(raw) => {
                write_file_synced(&dir.join(forward_index_file_name(name, ForwardIndexKind::Raw)), &raw.seal()?)?;
                self.field.data_type.fixed_width().map_or(0, |w| (w * 8) as u8)
            }
        };
        if let Some(dict) = &self.dictionary {
            write_file_synced(&dir.join(dictionary_file_name(name)), &dict.encode())?;
        }
        if let Some(inv) = self.inverted {
            write_file_synced(&dir.join(inverted_index_file_name(name)), &inv.seal()?)?;
        }

        let stats = self.stats;
        Ok(ColumnMetadata {
            name: self.field.name.clone(),
            data_type: self.field.data_type,
            field_type: self.field.field_type,
            cardinality: self.dictionary.as_ref().map_or(0, Dictionary::len),
            total_docs: stats.total_docs,
            total_number_of_entries: stats.total_number_of_entries,
            bits_per_element,
            max_number_of_multi_values: stats.max_number_of_multi_values,
            single_value: self.field.single_value,
            sorted: self.field.single_value && stats.sorted,
            has_dictionary: self.dictionary.is_some(),
            has_inverted_index,
            min_value: stats.min_value,
            max_value: stats.max_value,
            string_column_max_length: stats.string_column_max_length,
            compression: self.compression.map(|c| c.name().to_string()),
        })
    }
}

fn millis_since_epoch() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

fn time_value(v: &Value) -> Option<i64> {
    match v {
        Value::Int(x) => Some(*x as i64),
        Value::Long(x) => Some(*x),
        Value::Float(x) => Some(*x as i64),
        Value::Double(x) => Some(*x as i64),
        Value::String(s) => s.trim().parse().ok(),
    }
}

/// Drives one segment build over a record reader.
pub struct SegmentCreationDriver<R: RecordReader> {
    config: SegmentGeneratorConfig,
    reader: R,
    state: BuildState,
}

impl<R: RecordReader> SegmentCreationDriver<R> {
    pub fn new(config: SegmentGeneratorConfig, reader: R) -> Self {
        Self {
            config,
            reader,
            state: BuildState::Init,
        }
    }

    /// Current stage; after a failure, the stage that failed.
    pub fn state(&self) -> BuildState {
        self.state
    }

    pub fn config(&self) -> &SegmentGeneratorConfig {
        &self.config
    }

    fn transition(&mut self, to: BuildState) {
        let from = self.state;
        self.state = to;
        self.config.event_listener.on_event(SegmentEvent::BuildStateChanged {
            table: self.config.table_name.clone(),
            from,
            to,
        });
    }

    /// Runs every stage and publishes the segment. A driver builds at most once.
    pub fn build(&mut self) -> Result<SegmentBuildOutcome, QuarryError> {
        if self.state != BuildState::Init {
            return Err(QuarryError::BuildFailure {
                stage: self.state,
                reason: "segment creation driver already ran".to_string(),
            });
        }
        let started = Instant::now();
        match self.run() {
            Ok(outcome) => {
                let duration = started.elapsed();
                quarry_metrics::record_segment_built(duration, outcome.total_docs as u64);
                self.config.event_listener.on_event(SegmentEvent::SegmentBuilt {
                    name: outcome.name.clone(),
                    path: outcome.path.clone(),
                    total_docs: outcome.total_docs,
                    duration,
                });
                Ok(outcome)
            }
            Err(err) => {
                let stage = self.state;
                let reason = match err {
                    QuarryError::BuildFailure { reason, .. } => reason,
                    other => other.to_string(),
                };
                quarry_metrics::record_segment_build_failure();
                self.config.event_listener.on_event(SegmentEvent::SegmentBuildFailed {
                    table: self.config.table_name.clone(),
                    stage,
                    error: reason.clone(),
                });
                Err(QuarryError::BuildFailure { stage, reason })
            }
        }
    }

    fn run(&mut self) -> Result<SegmentBuildOutcome, QuarryError> {
        let schema = self.reader.schema().clone();
        self.config.validate(&schema)?;

        // --- Pass 1: statistics --- //
        self.transition(BuildState::StatsCollection);
        self.reader.rewind()?;
        let mut collector = SegmentStatsCollector::new(&schema, &self.config.no_dictionary_columns);
        while let Some(row) = self.reader.next_row()? {
            collector.collect_row(&row)?;
        }
        let total_docs = collector.total_docs();
        if total_docs == 0 {
            return Err(QuarryError::InvalidValue {
                column: schema.fields[0].name.clone(),
                details: "no input rows".to_string(),
            });
        }
        let stats = collector.seal();

        // --- Pass 2: dictionaries and indexes into a temp dir --- //
        self.transition(BuildState::IndexBuild);
        fs::create_dir_all(&self.config.out_dir)?;
        let staging = tempfile::Builder::new()
            .prefix(TEMP_DIR_PREFIX)
            .tempdir_in(&self.config.out_dir)?;

        let mut creators = schema
            .fields
            .iter()
            .zip(stats)
            .map(|(field, s)| ColumnCreator::new(field, s, &self.config))
            .collect::<Result<Vec<_>, _>>()?;

        self.reader.rewind()?;
        let mut row_id = 0u32;
        while let Some(row) = self.reader.next_row()? {
            if row_id >= total_docs {
                return Err(QuarryError::Internal(format!(
                    "input grew between passes: more than {} rows",
                    total_docs
                )));
            }
            for c in &mut creators {
                let values = normalize(&c.field, row.get(&c.field.name))?;
                c.index(row_id, &values)?;
            }
            row_id += 1;
        }
        if row_id != total_docs {
            return Err(QuarryError::Internal(format!(
                "input shrank between passes: {} rows, expected {}",
                row_id, total_docs
            )));
        }

        let time_column = schema.time_column().map(|f| f.name.clone());
        let mut time_range = None;
        let mut columns = Vec::with_capacity(creators.len());
        for c in creators {
            let meta = c.seal(staging.path())?;
            if time_column.as_deref() == Some(meta.name.as_str()) {
                time_range = meta
                    .min_value
                    .as_ref()
                    .and_then(time_value)
                    .zip(meta.max_value.as_ref().and_then(time_value));
            }
            columns.push(meta);
        }

        // --- Seal and publish --- //
        self.transition(BuildState::Seal);
        let name = self.segment_name(time_range);
        let creation_time_millis = millis_since_epoch();
        let metadata = SegmentMetadata {
            name: name.clone(),
            table_name: self.config.table_name.clone(),
            version: SEGMENT_FORMAT_VERSION,
            total_docs,
            columns,
            time_column,
            start_time: time_range.map(|(lo, _)| lo),
            end_time: time_range.map(|(_, hi)| hi),
            creation_time_millis,
            crc: None,
        };
        write_file_synced(&staging.path().join(METADATA_FILE), &encode_metadata(&metadata)?)?;
        let crc = compute_segment_crc(staging.path())?;
        let creation = CreationMeta {
            crc: crc as i64,
            creation_time_millis,
        };
        write_file_synced(&staging.path().join(CREATION_META_FILE), &creation.encode())?;
        sync_dir(staging.path())?;

        // claim the name with an empty dir; the rename only ever replaces that one
        let final_path = self.config.out_dir.join(&name);
        if let Err(e) = fs::create_dir(&final_path) {
            if e.kind() == ErrorKind::AlreadyExists {
                return Err(QuarryError::BuildFailure {
                    stage: BuildState::Seal,
                    reason: format!("segment {} already exists at {}", name, final_path.display()),
                });
            }
            return Err(e.into());
        }
        let staged = staging.keep();
        if let Err(e) = fs::rename(&staged, &final_path) {
            let _ = fs::remove_dir_all(&staged);
            let _ = fs::remove_dir(&final_path);
            return Err(e.into());
        }
        sync_parent_dir(&final_path)?;

        self.transition(BuildState::Done);
        Ok(SegmentBuildOutcome {
            name,
            path: final_path,
            total_docs,
            crc,
        })
    }

    /// `<table>_<min>_<max>[_<postfix>]` with a time range, `<table>[_<postfix>]` without.
    fn segment_name(&self, time_range: Option<(i64, i64)>) -> String {
        if let Some(name) = &self.config.segment_name {
            return name.clone();
        }
        let mut name = match time_range {
            Some((lo, hi)) => format!("{}_{}_{}", self.config.table_name, lo, hi),
            None => self.config.table_name.clone(),
        };
        if let Some(postfix) = &self.config.segment_name_postfix {
            name.push('_');
            name.push_str(postfix);
        }
        name
    }
}

/// Builds one segment from `reader` with `config`.
pub fn create_segment<R: RecordReader>(
    config: SegmentGeneratorConfig,
    reader: R,
) -> Result<SegmentBuildOutcome, QuarryError> {
    SegmentCreationDriver::new(config, reader).build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record_reader::InMemoryRecordReader;
    use crate::types::{DataType, GenericRow};

    fn schema() -> Schema {
        Schema::new()
            .with_dimension("country", DataType::String)
            .with_metric("clicks", DataType::Long)
            .with_time("day", DataType::Int)
    }

    fn rows() -> Vec<GenericRow> {
        vec![
            GenericRow::new().with_single("country", "us").with_single("clicks", 3i64).with_single("day", 17),
            GenericRow::new().with_single("country", "ca").with_single("clicks", 1i64).with_single("day", 15),
        ]
    }

    #[test]
    fn builds_named_segment_and_reaches_done() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = SegmentGeneratorConfig::new("events", dir.path());
        config.segment_name_postfix = Some("0".to_string());
        config.no_dictionary_columns = vec!["clicks".to_string()];
        let mut driver = SegmentCreationDriver::new(config, InMemoryRecordReader::new(schema(), rows()));
        let outcome = driver.build().unwrap();
        assert_eq!(driver.state(), BuildState::Done);
        assert_eq!(outcome.name, "events_15_17_0");
        assert_eq!(outcome.total_docs, 2);
        assert!(outcome.path.join(METADATA_FILE).is_file());
        assert!(outcome.path.join(CREATION_META_FILE).is_file());
        assert!(outcome.path.join("clicks.raw.fwd").is_file());
        assert!(!outcome.path.join("clicks.dict").exists());

        // a second build may not overwrite
        let mut again = SegmentCreationDriver::new(
            {
                let mut c = SegmentGeneratorConfig::new("events", dir.path());
                c.segment_name_postfix = Some("0".to_string());
                c
            },
            InMemoryRecordReader::new(schema(), rows()),
        );
        match again.build() {
            Err(QuarryError::BuildFailure { stage, reason }) => {
                assert_eq!(stage, BuildState::Seal);
                assert!(reason.contains("already exists"));
            }
            other => panic!("expected BuildFailure, got {:?}", other),
        }
        // nothing but the first segment remains
        let entries: Vec<_> = fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn directory_claimed_at_the_final_name_is_left_alone() {
        let dir = tempfile::tempdir().unwrap();
        let taken = dir.path().join("events_15_17");
        fs::create_dir(&taken).unwrap();

        let config = SegmentGeneratorConfig::new("events", dir.path());
        match create_segment(config, InMemoryRecordReader::new(schema(), rows())) {
            Err(QuarryError::BuildFailure { stage, reason }) => {
                assert_eq!(stage, BuildState::Seal);
                assert!(reason.contains("already exists"));
            }
            other => panic!("expected BuildFailure, got {:?}", other),
        }
        // the empty directory was not replaced and no staging directory is left behind
        assert!(taken.is_dir());
        assert_eq!(fs::read_dir(&taken).unwrap().count(), 0);
        let names: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["events_15_17".to_string()]);
    }

    #[test]
    fn published_segment_leaves_no_staging_directory() {
        let dir = tempfile::tempdir().unwrap();
        let outcome = create_segment(
            SegmentGeneratorConfig::new("events", dir.path()),
            InMemoryRecordReader::new(schema(), rows()),
        )
        .unwrap();
        assert!(outcome.path.join(CREATION_META_FILE).is_file());
        let stray = fs::read_dir(dir.path())
            .unwrap()
            .filter(|e| e.as_ref().unwrap().file_name().to_string_lossy().starts_with(TEMP_DIR_PREFIX))
            .count();
        assert_eq!(stray, 0);
    }

    #[test]
    fn raw_string_column_is_rejected_at_init() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = SegmentGeneratorConfig::new("events", dir.path());
        config.no_dictionary_columns = vec!["country".to_string()];
        let mut driver = SegmentCreationDriver::new(config, InMemoryRecordReader::new(schema(), rows()));
        match driver.build() {
            Err(QuarryError::BuildFailure { stage, .. }) => assert_eq!(stage, BuildState::Init),
            other => panic!("expected BuildFailure, got {:?}", other),
        }
        assert!(driver.build().is_err());
    }

    #[test]
    fn empty_input_fails_in_stats_collection() {
        let dir = tempfile::tempdir().unwrap();
        let config = SegmentGeneratorConfig::new("events", dir.path());
        match create_segment(config, InMemoryRecordReader::new(schema(), Vec::new())) {
            Err(QuarryError::BuildFailure { stage, reason }) => {
                assert_eq!(stage, BuildState::StatsCollection);
                assert!(reason.contains("no input rows"));
            }
            other => panic!("expected BuildFailure, got {:?}", other),
        }
    }
}
