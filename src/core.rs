//! Engine facade: owns the loaded segments of a data directory and ties together creation,
//! loading and query execution.

use crate::buffer::ReadMode;
use crate::creator::{SegmentBuildOutcome, SegmentCreationDriver, SegmentGeneratorConfig};
use crate::error::QuarryError;
use crate::inverted_index::DEFAULT_MAX_CACHED_BITMAPS;
use crate::loader::{load_with_options, ImmutableSegment, LoadOptions};
use crate::metadata::CREATION_META_FILE;
use crate::query::{QueryConfig, QueryExecutor, QueryRequest, ReducedResult};
use crate::record_reader::RecordReader;
use crate::telemetry::{noop_event_listener, SegmentEvent, SegmentEventListener};

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

/// Configuration options for the [`Engine`].
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Directory segments are built into and loaded from.
    pub data_dir: PathBuf,
    /// How segment files are brought into memory.
    pub read_mode: ReadMode,
    /// Bound on resident decoded bitmaps per inverted index.
    pub bitmap_cache_capacity: usize,
    /// Recompute and compare the directory crc on load.
    pub verify_crc: bool,
    /// Query execution tunables.
    pub query: QueryConfig,
    /// Defaults for segments built through the engine. `out_dir` is replaced by `data_dir`.
    pub generator: SegmentGeneratorConfig,
    /// Structured event hook for observability (no-op by default).
    pub event_listener: Arc<dyn SegmentEventListener>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            data_dir: PathBuf::from("./data"),
            read_mode: ReadMode::Heap,
            bitmap_cache_capacity: DEFAULT_MAX_CACHED_BITMAPS,
            verify_crc: true,
            query: QueryConfig::default(),
            generator: SegmentGeneratorConfig::default(),
            event_listener: noop_event_listener(),
        }
    }
}

/// Loaded segments of one data directory.
///
/// Segments are immutable once loaded; the engine only tracks which ones participate in
/// queries. Dropping a segment from the engine does not delete its directory.
#[derive(Debug)]
pub struct Engine {
    config: EngineConfig,
    segments: RwLock<BTreeMap<String, Arc<ImmutableSegment>>>,
    executor: QueryExecutor,
}

impl Engine {
    /// Creates an engine over `config.data_dir`, creating the directory if needed.
    ///
    /// No segments are loaded; call [`Engine::load_all`] to pick up existing ones.
    ///
    /// # Errors
    /// Returns an error if the data directory cannot be created.
    pub fn with_config(config: EngineConfig) -> Result<Self, QuarryError> {
        fs::create_dir_all(&config.data_dir)?;
        let mut query = config.query.clone();
        query.event_listener = Arc::clone(&config.event_listener);
        Ok(Self {
            executor: QueryExecutor::new(query),
            segments: RwLock::new(BTreeMap::new()),
            config,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn load_options(&self) -> LoadOptions {
        LoadOptions {
            read_mode: self.config.read_mode,
            bitmap_cache_capacity: self.config.bitmap_cache_capacity,
            verify_crc: self.config.verify_crc,
        }
    }

    /// Builds a segment from `reader` into the data directory and loads it.
    ///
    /// # Arguments
    /// * `config` - Per-build settings; `out_dir` and `event_listener` are taken from the engine.
    /// * `reader` - The rows, read twice.
    ///
    /// # Returns
    /// * The build outcome and the loaded segment.
    pub fn build_segment<R: RecordReader>(
        &self,
        config: SegmentGeneratorConfig,
        reader: R,
    ) -> Result<(SegmentBuildOutcome, Arc<ImmutableSegment>), QuarryError> {
        let config = SegmentGeneratorConfig {
            out_dir: self.config.data_dir.clone(),
            event_listener: Arc::clone(&self.config.event_listener),
            ..config
        };
        let outcome = SegmentCreationDriver::new(config, reader).build()?;
        let segment = self.load_segment(&outcome.path)?;
        Ok((outcome, segment))
    }

    /// Builds a segment with the engine's generator defaults for `table`.
    pub fn build_table_segment<R: RecordReader>(
        &self,
        table: &str,
        reader: R,
    ) -> Result<(SegmentBuildOutcome, Arc<ImmutableSegment>), QuarryError> {
        let config = SegmentGeneratorConfig {
            table_name: table.to_string(),
            ..self.config.generator.clone()
        };
        self.build_segment(config, reader)
    }

    /// Loads the segment at `path` and registers it under its name, replacing any segment of
    /// the same name.
    pub fn load_segment(&self, path: &Path) -> Result<Arc<ImmutableSegment>, QuarryError> {
        match load_with_options(path, &self.load_options()) {
            Ok(segment) => {
                self.config.event_listener.on_event(SegmentEvent::SegmentLoaded {
                    name: segment.name().to_string(),
                    read_mode: segment.read_mode(),
                    total_docs: segment.total_docs(),
                });
                self.segments
                    .write()?
                    .insert(segment.name().to_string(), Arc::clone(&segment));
                Ok(segment)
            }
            Err(e) => {
                self.config.event_listener.on_event(SegmentEvent::SegmentLoadFailed {
                    path: path.to_path_buf(),
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// Loads every sealed segment directory directly under the data directory.
    ///
    /// Directories without `creation.meta` (including in-progress builds) are skipped. Any
    /// sealed segment that fails to load fails the whole call.
    pub fn load_all(&self) -> Result<Vec<Arc<ImmutableSegment>>, QuarryError> {
        let mut dirs: Vec<PathBuf> = fs::read_dir(&self.config.data_dir)?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.is_dir() && p.join(CREATION_META_FILE).is_file())
            .collect();
        dirs.sort();
        dirs.iter().map(|p| self.load_segment(p)).collect()
    }

    /// Registered segments in name order.
    pub fn segments(&self) -> Result<Vec<Arc<ImmutableSegment>>, QuarryError> {
        Ok(self.segments.read()?.values().cloned().collect())
    }

    pub fn segment(&self, name: &str) -> Result<Option<Arc<ImmutableSegment>>, QuarryError> {
        Ok(self.segments.read()?.get(name).cloned())
    }

    /// Unregisters a segment. Queries already holding it finish normally.
    pub fn drop_segment(&self, name: &str) -> Result<Option<Arc<ImmutableSegment>>, QuarryError> {
        let dropped = self.segments.write()?.remove(name);
        if dropped.is_some() {
            self.config.event_listener.on_event(SegmentEvent::SegmentDropped { name: name.to_string() });
        }
        Ok(dropped)
    }

    /// Runs `request` over every registered segment.
    pub fn execute(&self, request: &QueryRequest) -> Result<ReducedResult, QuarryError> {
        let segments = self.segments()?;
        self.executor.execute(&segments, request)
    }
}
