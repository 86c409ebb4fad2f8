//! Command-line front end for quarry segments.
//!
//! Loads configuration from (in precedence order): defaults, config file, environment variables
//! (`QUARRY_*`), and CLI flags. Subcommands build a segment from an input file, print a
//! segment's metadata, or run a JSON query over every segment in the data directory.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use config::{Config, Environment, File};
use quarry::encoding::BlockCompression;
use quarry::telemetry::{noop_event_listener, SegmentEvent, SegmentEventListener};
use quarry::{
    load_with_options, open_record_reader, Engine, EngineConfig, InputFormat, LoadOptions, QueryRequest, ReadMode,
    Schema, SegmentGeneratorConfig,
};

// ---------- CLI ----------

/// quarry columnar segment tool.
#[derive(Parser, Debug)]
#[command(name = "quarry", version, about)]
pub struct Cli {
    /// Path to config file (TOML). If omitted, `quarry.toml` is loaded when it exists.
    #[arg(long, env = "QUARRY_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Do not load any config file; use defaults + env + CLI only.
    #[arg(long, default_value_t = false, global = true)]
    pub no_config: bool,

    /// Override the data directory segments are built into and loaded from.
    #[arg(long, env = "QUARRY_DATA_DIR", global = true)]
    pub data_dir: Option<PathBuf>,

    /// How segment files are read: heap or mmap.
    #[arg(long, env = "QUARRY_READ_MODE", global = true)]
    pub read_mode: Option<ReadMode>,

    /// Load and validate config (file + env + CLI), print the effective values, then exit.
    #[arg(long, default_value_t = false)]
    pub validate_config: bool,

    /// Print segment and query events to stderr.
    #[arg(long, short, default_value_t = false, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Build one segment from an input file.
    Create {
        /// Schema file (JSON, `{"fields": [...]}`).
        #[arg(long)]
        schema: PathBuf,
        /// Input rows.
        #[arg(long)]
        input: PathBuf,
        #[arg(long, default_value = "json")]
        format: InputFormat,
        #[arg(long)]
        table: String,
        /// Output directory; defaults to the data directory.
        #[arg(long)]
        out: Option<PathBuf>,
        #[arg(long)]
        segment_name: Option<String>,
        #[arg(long)]
        postfix: Option<String>,
        /// Columns that get an inverted index (comma separated).
        #[arg(long, value_delimiter = ',')]
        inverted: Vec<String>,
        /// Numeric columns stored without a dictionary (comma separated).
        #[arg(long, value_delimiter = ',')]
        no_dictionary: Vec<String>,
    },
    /// Print a segment's metadata as JSON.
    Inspect {
        segment: PathBuf,
    },
    /// Run a JSON query request over every segment in the data directory.
    Query {
        #[arg(long)]
        request: PathBuf,
    },
}

// ---------- File/env config (all optional for partial config) ----------

/// Query section in the config file.
#[derive(Debug, Default, serde::Deserialize)]
pub struct QueryFileConfig {
    pub max_docs_per_block: Option<usize>,
    pub num_groups_limit: Option<usize>,
}

/// Segment creation defaults in the config file.
#[derive(Debug, Default, serde::Deserialize)]
pub struct GeneratorFileConfig {
    pub inverted_index_columns: Option<Vec<String>>,
    pub no_dictionary_columns: Option<Vec<String>>,
    /// Table form in TOML: `[generator.raw_compression]` with `type = "lz4"` or `type = "zstd", level = 3`.
    pub raw_compression: Option<BlockCompression>,
    pub raw_docs_per_chunk: Option<u32>,
}

/// Top-level config as read from file + env. Every field optional for layering.
#[derive(Debug, Default, serde::Deserialize)]
pub struct QuarryFileConfig {
    pub data_dir: Option<String>,
    pub read_mode: Option<ReadMode>,
    pub bitmap_cache_capacity: Option<usize>,
    pub verify_crc: Option<bool>,
    pub query: Option<QueryFileConfig>,
    pub generator: Option<GeneratorFileConfig>,
}

/// Load merged config. CLI overrides file/env.
fn load_engine_config(cli: &Cli) -> Result<EngineConfig, String> {
    let mut builder = Config::builder();

    if !cli.no_config {
        if let Some(ref path) = cli.config {
            if !path.exists() {
                return Err(format!("config file not found: {}", path.display()));
            }
            builder = builder.add_source(File::from(path.as_path()).required(false));
        } else {
            let default_path = PathBuf::from("quarry.toml");
            if default_path.exists() {
                builder = builder.add_source(File::from(default_path.as_path()).required(false));
            }
        }
    }

    builder = builder.add_source(
        Environment::with_prefix("QUARRY")
            .prefix_separator("_")
            .separator("__")
            .try_parsing(true)
            .ignore_empty(true),
    );

    let merged = builder.build().map_err(|e| e.to_string())?;
    let partial: QuarryFileConfig = merged.try_deserialize().map_err(|e| e.to_string())?;

    let mut engine_config = EngineConfig::default();
    merge_into_engine_config(&mut engine_config, &partial)?;

    if let Some(ref d) = cli.data_dir {
        engine_config.data_dir = d.clone();
    }
    if let Some(mode) = cli.read_mode {
        engine_config.read_mode = mode;
    }
    let listener: Arc<dyn SegmentEventListener> = if cli.verbose {
        Arc::new(StderrEventListener)
    } else {
        noop_event_listener()
    };
    engine_config.event_listener = Arc::clone(&listener);
    engine_config.query.event_listener = listener;
    Ok(engine_config)
}

/// Merge file/env partial config onto `EngineConfig`. Only overwrites fields that are `Some`.
fn merge_into_engine_config(base: &mut EngineConfig, partial: &QuarryFileConfig) -> Result<(), String> {
    if let Some(s) = &partial.data_dir {
        base.data_dir = PathBuf::from(s);
    }
    if let Some(mode) = partial.read_mode {
        base.read_mode = mode;
    }
    if let Some(n) = partial.bitmap_cache_capacity {
        base.bitmap_cache_capacity = n;
    }
    if let Some(b) = partial.verify_crc {
        base.verify_crc = b;
    }
    if let Some(q) = &partial.query {
        if let Some(n) = q.max_docs_per_block {
            if n == 0 {
                return Err("query.max_docs_per_block must be positive".to_string());
            }
            base.query.max_docs_per_block = n;
        }
        if let Some(n) = q.num_groups_limit {
            if n == 0 {
                return Err("query.num_groups_limit must be positive".to_string());
            }
            base.query.num_groups_limit = n;
        }
    }
    if let Some(g) = &partial.generator {
        if let Some(cols) = &g.inverted_index_columns {
            base.generator.inverted_index_columns = cols.clone();
        }
        if let Some(cols) = &g.no_dictionary_columns {
            base.generator.no_dictionary_columns = cols.clone();
        }
        if let Some(c) = g.raw_compression {
            base.generator.raw_compression = c;
        }
        if let Some(n) = g.raw_docs_per_chunk {
            base.generator.raw_docs_per_chunk = n;
        }
    }
    Ok(())
}

// ---------- Events ----------

#[derive(Debug)]
struct StderrEventListener;

impl SegmentEventListener for StderrEventListener {
    fn on_event(&self, event: SegmentEvent) {
        match event {
            SegmentEvent::BuildStateChanged { table, from, to } => {
                eprintln!("[{}] {} -> {}", table, from, to)
            }
            SegmentEvent::SegmentBuilt {
                name,
                path,
                total_docs,
                duration,
            } => eprintln!(
                "built {} ({} docs) at {} in {:?}",
                name,
                total_docs,
                path.display(),
                duration
            ),
            other => eprintln!("{:?}", other),
        }
    }
}

// ---------- Commands ----------

fn read_schema(path: &Path) -> Result<Schema, Box<dyn std::error::Error + Send + Sync>> {
    let bytes = std::fs::read(path).map_err(|e| format!("cannot read schema {}: {}", path.display(), e))?;
    let schema: Schema = serde_json::from_slice(&bytes).map_err(|e| format!("bad schema {}: {}", path.display(), e))?;
    Ok(schema)
}

fn print_effective_config(config: &EngineConfig) {
    println!("data_dir={}", config.data_dir.display());
    println!("read_mode={}", config.read_mode);
    println!("bitmap_cache_capacity={}", config.bitmap_cache_capacity);
    println!("verify_crc={}", config.verify_crc);
    println!("max_docs_per_block={}", config.query.max_docs_per_block);
    println!("num_groups_limit={}", config.query.num_groups_limit);
    println!("raw_compression={}", config.generator.raw_compression.name());
    println!("raw_docs_per_chunk={}", config.generator.raw_docs_per_chunk);
}

fn run(cli: Cli, config: EngineConfig) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let Some(command) = cli.command else {
        return Err("no command given (try --help)".into());
    };
    match command {
        Command::Create {
            schema,
            input,
            format,
            table,
            out,
            segment_name,
            postfix,
            inverted,
            no_dictionary,
        } => {
            let schema = read_schema(&schema)?;
            let reader = open_record_reader(format, &input, schema)?;
            let mut generator = SegmentGeneratorConfig {
                table_name: table,
                out_dir: out.unwrap_or_else(|| config.data_dir.clone()),
                segment_name,
                segment_name_postfix: postfix,
                event_listener: Arc::clone(&config.event_listener),
                ..config.generator.clone()
            };
            if !inverted.is_empty() {
                generator.inverted_index_columns = inverted;
            }
            if !no_dictionary.is_empty() {
                generator.no_dictionary_columns = no_dictionary;
            }
            let outcome = quarry::create_segment(generator, reader)?;
            println!("segment={}", outcome.name);
            println!("path={}", outcome.path.display());
            println!("total_docs={}", outcome.total_docs);
            println!("crc={:#010x}", outcome.crc);
        }
        Command::Inspect { segment } => {
            let loaded = load_with_options(
                &segment,
                &LoadOptions {
                    read_mode: config.read_mode,
                    bitmap_cache_capacity: config.bitmap_cache_capacity,
                    verify_crc: config.verify_crc,
                },
            )?;
            println!("{}", serde_json::to_string_pretty(loaded.metadata())?);
        }
        Command::Query { request } => {
            let bytes =
                std::fs::read(&request).map_err(|e| format!("cannot read request {}: {}", request.display(), e))?;
            let request: QueryRequest = serde_json::from_slice(&bytes)?;
            let engine = Engine::with_config(config)?;
            engine.load_all()?;
            let result = engine.execute(&request)?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
    }
    Ok(())
}

// ---------- Main ----------

fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let cli = Cli::parse();
    let config = load_engine_config(&cli).map_err(|e| {
        eprintln!("config error: {}", e);
        e
    })?;

    if cli.validate_config {
        print_effective_config(&config);
        return Ok(());
    }

    run(cli, config).map_err(|e| {
        eprintln!("error: {}", e);
        e
    })
}
