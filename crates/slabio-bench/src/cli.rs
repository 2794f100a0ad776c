use clap::Parser;

/// In-process parallel write/read benchmark for the slabio pipeline.
///
/// Rank threads share one in-memory backend; the numbers measure the
/// redistribution and writer pipeline, not a disk.
#[derive(Parser, Debug, Clone)]
#[command(name = "slabio-bench", about = "slabio write/read pipeline benchmark")]
pub struct CliArgs {
    /// Number of rank threads
    #[arg(short = 'n', long = "ranks", default_value_t = 4)]
    pub ranks: i32,

    /// I/O task stride (rank % stride == 0 performs I/O)
    #[arg(short = 's', long = "stride", default_value_t = 2)]
    pub stride: i32,

    /// Decomposed elements per rank
    #[arg(short = 'e', long = "elements", default_value_t = 4096)]
    pub elements: u64,

    /// Record frames written and read back
    #[arg(short = 'f', long = "frames", default_value_t = 16)]
    pub frames: i64,

    /// Aggregation factor (0 disables intra-group aggregation)
    #[arg(short = 'g', long = "agg-factor", default_value_t = 0)]
    pub agg_factor: i32,

    /// Attached buffer budget in bytes
    #[arg(long = "buf-size", default_value_t = 16 * 1024 * 1024)]
    pub buf_size: u64,

    /// Max outstanding non-blocking requests per file
    #[arg(long = "n-reqs", default_value_t = 512)]
    pub n_reqs: usize,

    /// Backend path of the benchmark file
    #[arg(short = 'o', long = "path", default_value = "bench.slab")]
    pub path: String,

    /// Emit the report as JSON instead of text
    #[arg(long = "json")]
    pub json: bool,
}
