use std::path::PathBuf;
use std::sync::Arc;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::buffer::ReadMode;
use crate::creator::BuildState;

/// Structured, in-process event hook for observability.
///
/// The library never prints. Callers that want logs provide an implementation that forwards
/// these events to `tracing`, `log`, stderr or a custom sink. Listeners are passed down through
/// configuration objects; there is no global listener.
pub trait SegmentEventListener: std::fmt::Debug + Send + Sync + 'static {
    fn on_event(&self, event: SegmentEvent);
}

/// Structured events emitted by segment creation, loading and query execution.
#[derive(Debug, Clone)]
pub enum SegmentEvent {
    BuildStateChanged {
        table: String,
        from: BuildState,
        to: BuildState,
    },
    SegmentBuilt {
        name: String,
        path: PathBuf,
        total_docs: u32,
        duration: Duration,
    },
    SegmentBuildFailed {
        table: String,
        stage: BuildState,
        error: String,
    },

    SegmentLoaded {
        name: String,
        read_mode: ReadMode,
        total_docs: u32,
    },
    SegmentLoadFailed { path: PathBuf, error: String },
    SegmentDropped { name: String },

    GroupsTrimmed { evicted: usize, retained: usize },
    QueryExecuted {
        segments: usize,
        docs_scanned: u64,
        duration: Duration,
    },
}

#[derive(Debug)]
pub struct NoopEventListener;

impl SegmentEventListener for NoopEventListener {
    #[inline]
    fn on_event(&self, _event: SegmentEvent) {}
}

pub fn noop_event_listener() -> Arc<dyn SegmentEventListener> {
    Arc::new(NoopEventListener)
}

/// Metrics instrumentation through the `metrics` facade, plus optional in-process scraping.
///
/// Recording is effectively a no-op until a recorder is installed, so the library can
/// instrument unconditionally.
pub mod quarry_metrics {
    use super::*;

    use ::metrics::{describe_counter, describe_gauge, describe_histogram, Unit};

    #[cfg(feature = "prometheus")]
    use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

    // --- metric names ---
    //
    // Counters are exposed as `<name>_total` by the Prometheus exporter; histograms as
    // `<name>_bucket`, `<name>_sum`, `<name>_count`.

    pub const SEGMENTS_BUILT: &str = "quarry_segments_built";
    pub const SEGMENT_BUILD_FAILURES: &str = "quarry_segment_build_failures";
    pub const SEGMENT_BUILD_DURATION_SECONDS: &str = "quarry_segment_build_duration_seconds";
    pub const ROWS_INDEXED: &str = "quarry_rows_indexed";

    pub const SEGMENTS_LOADED: &str = "quarry_segments_loaded";
    pub const SEGMENT_LOAD_DURATION_SECONDS: &str = "quarry_segment_load_duration_seconds";

    pub const BITMAP_CACHE_HITS: &str = "quarry_bitmap_cache_hits";
    pub const BITMAP_CACHE_MISSES: &str = "quarry_bitmap_cache_misses";
    pub const BITMAP_CACHE_EVICTIONS: &str = "quarry_bitmap_cache_evictions";

    pub const QUERY_DURATION_SECONDS: &str = "quarry_query_duration_seconds";
    pub const DOCS_SCANNED: &str = "quarry_docs_scanned";
    pub const GROUPS_TRIMMED: &str = "quarry_groups_trimmed";
    pub const RESIDENT_GROUPS: &str = "quarry_resident_groups";

    /// Handle to the in-process Prometheus recorder/scrape renderer.
    ///
    /// This does **not** start an HTTP server. Call [`InProcessPrometheus::render`] to scrape.
    #[cfg(feature = "prometheus")]
    #[derive(Debug)]
    pub struct InProcessPrometheus {
        handle: PrometheusHandle,
        stop: Arc<AtomicBool>,
        upkeep_thread: Mutex<Option<JoinHandle<()>>>,
    }

    #[cfg(feature = "prometheus")]
    impl InProcessPrometheus {
        /// Installs a global Prometheus recorder (once per process) and starts a small upkeep thread.
        pub fn install(upkeep_interval: Duration) -> Result<Self, MetricsInitError> {
            describe_all();

            let handle = PrometheusBuilder::new()
                .install_recorder()
                .map_err(MetricsInitError::from_build_error)?;

            let stop = Arc::new(AtomicBool::new(false));
            let stop_clone = stop.clone();
            let handle_clone = handle.clone();
            let upkeep_thread = std::thread::Builder::new()
                .name("quarry-metrics-upkeep".to_string())
                .spawn(move || {
                    while !stop_clone.load(Ordering::Relaxed) {
                        std::thread::sleep(upkeep_interval);
                        handle_clone.run_upkeep();
                    }
                })
                .map_err(|e| MetricsInitError::ThreadSpawn(e.to_string()))?;

            Ok(Self {
                handle,
                stop,
                upkeep_thread: Mutex::new(Some(upkeep_thread)),
            })
        }

        /// Renders the current metrics in the Prometheus text exposition format.
        pub fn render(&self) -> String {
            self.handle.render()
        }
    }

    #[cfg(feature = "prometheus")]
    impl Drop for InProcessPrometheus {
        fn drop(&mut self) {
            self.stop.store(true, Ordering::Relaxed);
            if let Ok(mut guard) = self.upkeep_thread.lock() {
                if let Some(t) = guard.take() {
                    let _ = t.join();
                }
            }
        }
    }

    #[cfg(feature = "prometheus")]
    #[derive(Debug, thiserror::Error)]
    pub enum MetricsInitError {
        #[error("metrics recorder already installed")]
        AlreadyInstalled,
        #[error("failed to install prometheus recorder: {0}")]
        Install(String),
        #[error("failed to spawn upkeep thread: {0}")]
        ThreadSpawn(String),
    }

    #[cfg(feature = "prometheus")]
    impl MetricsInitError {
        fn from_build_error(e: BuildError) -> Self {
            match e {
                BuildError::FailedToSetGlobalRecorder(_) => MetricsInitError::AlreadyInstalled,
                other => MetricsInitError::Install(other.to_string()),
            }
        }
    }

    #[inline]
    pub fn record_segment_built(duration: Duration, rows: u64) {
        ::metrics::counter!(SEGMENTS_BUILT).increment(1);
        ::metrics::histogram!(SEGMENT_BUILD_DURATION_SECONDS).record(duration.as_secs_f64());
        if rows > 0 {
            ::metrics::counter!(ROWS_INDEXED).increment(rows);
        }
    }

    #[inline]
    pub fn record_segment_build_failure() {
        ::metrics::counter!(SEGMENT_BUILD_FAILURES).increment(1);
    }

    #[inline]
    pub fn record_segment_loaded(duration: Duration) {
        ::metrics::counter!(SEGMENTS_LOADED).increment(1);
        ::metrics::histogram!(SEGMENT_LOAD_DURATION_SECONDS).record(duration.as_secs_f64());
    }

    #[inline]
    pub fn record_bitmap_cache_hit() {
        ::metrics::counter!(BITMAP_CACHE_HITS).increment(1);
    }

    #[inline]
    pub fn record_bitmap_cache_miss() {
        ::metrics::counter!(BITMAP_CACHE_MISSES).increment(1);
    }

    #[inline]
    pub fn record_bitmap_cache_evictions(evicted: u64) {
        if evicted > 0 {
            ::metrics::counter!(BITMAP_CACHE_EVICTIONS).increment(evicted);
        }
    }

    #[inline]
    pub fn record_query(duration: Duration, docs_scanned: u64) {
        ::metrics::histogram!(QUERY_DURATION_SECONDS).record(duration.as_secs_f64());
        if docs_scanned > 0 {
            ::metrics::counter!(DOCS_SCANNED).increment(docs_scanned);
        }
    }

    #[inline]
    pub fn record_groups_trimmed(evicted: u64, resident: usize) {
        if evicted > 0 {
            ::metrics::counter!(GROUPS_TRIMMED).increment(evicted);
        }
        ::metrics::gauge!(RESIDENT_GROUPS).set(resident as f64);
    }

    pub fn describe_all() {
        // Counters
        describe_counter!(SEGMENTS_BUILT, Unit::Count, "Segments sealed and published.");
        describe_counter!(
            SEGMENT_BUILD_FAILURES,
            Unit::Count,
            "Segment builds aborted before publish."
        );
        describe_counter!(
            ROWS_INDEXED,
            Unit::Count,
            "Rows written into sealed segments."
        );
        describe_counter!(SEGMENTS_LOADED, Unit::Count, "Segments loaded for querying.");
        describe_counter!(
            BITMAP_CACHE_HITS,
            Unit::Count,
            "Inverted index lookups served from a cached bitmap."
        );
        describe_counter!(
            BITMAP_CACHE_MISSES,
            Unit::Count,
            "Inverted index lookups that decoded a bitmap from the segment buffer."
        );
        describe_counter!(
            BITMAP_CACHE_EVICTIONS,
            Unit::Count,
            "Cached bitmaps dropped to stay within the cache bound."
        );
        describe_counter!(
            DOCS_SCANNED,
            Unit::Count,
            "Documents that passed the filter and were fed to aggregation."
        );
        describe_counter!(
            GROUPS_TRIMMED,
            Unit::Count,
            "Groups evicted from group-by result holders at capacity."
        );

        // Histograms
        describe_histogram!(
            SEGMENT_BUILD_DURATION_SECONDS,
            Unit::Seconds,
            "Wall time from driver start to publish."
        );
        describe_histogram!(
            SEGMENT_LOAD_DURATION_SECONDS,
            Unit::Seconds,
            "Time to verify and open a segment directory."
        );
        describe_histogram!(
            QUERY_DURATION_SECONDS,
            Unit::Seconds,
            "Time to execute and reduce one query across segments."
        );

        // Gauges
        describe_gauge!(
            RESIDENT_GROUPS,
            Unit::Count,
            "Groups resident in the most recently trimmed result holder."
        );
    }
}
