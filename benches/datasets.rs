use quarry::{DataType, GenericRow, Schema};
use rand::Rng;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

pub const DEFAULT_SEED: u64 = 0x_5155_4152_5259_4245; // fixed seed for stable benchmarks

pub fn bench_schema() -> Schema {
    Schema::new()
        .with_dimension("country", DataType::String)
        .with_dimension("device", DataType::Int)
        .with_multi_value_dimension("tags", DataType::String)
        .with_metric("clicks", DataType::Long)
        .with_metric("cost", DataType::Double)
        .with_time("day", DataType::Int)
}

/// Rows with uniformly drawn dimensions. `day` grows with the row index so it is sorted.
pub fn generate_rows(
    seed: u64,
    rows: usize,
    country_cardinality: u32,
    device_cardinality: u32,
    tag_cardinality: u32,
    max_tags: usize,
) -> Vec<GenericRow> {
    assert!(country_cardinality > 0);
    assert!(device_cardinality > 0);
    assert!(tag_cardinality > 0);
    assert!(max_tags > 0);

    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut out = Vec::with_capacity(rows);

    for i in 0..rows {
        let country = format!("c{:03}", rng.random_range(0..country_cardinality));
        let device = rng.random_range(0..device_cardinality) as i32;
        let n_tags = rng.random_range(1..=max_tags);
        let tags: Vec<String> = (0..n_tags)
            .map(|_| format!("t{}", rng.random_range(0..tag_cardinality)))
            .collect();
        let clicks = rng.random_range(0..1_000i64);
        let cost = rng.random::<u32>() as f64 * 0.001;

        out.push(
            GenericRow::new()
                .with_single("country", country)
                .with_single("device", device)
                .with_multi("tags", tags)
                .with_single("clicks", clicks)
                .with_single("cost", cost)
                .with_single("day", (i / 1_000) as i32),
        );
    }

    out
}
