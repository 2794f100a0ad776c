use serde::Serialize;

const MEBIBYTE: f64 = 1_048_576.0;

/// Aggregate result of one benchmark run, reduced to rank 0.
#[derive(Debug, Clone, Serialize)]
pub struct BenchReport {
    pub ranks: i32,
    pub io_tasks: i32,
    pub stride: i32,
    pub elements_per_rank: u64,
    pub frames: i64,
    pub agg_factor: i32,
    pub bytes_per_phase: u64,
    pub write_secs: f64,
    pub write_mib_per_s: f64,
    pub read_secs: f64,
    pub read_mib_per_s: f64,
    pub verify_errors: u64,
}

impl BenchReport {
    pub fn new(
        ranks: i32,
        io_tasks: i32,
        stride: i32,
        elements_per_rank: u64,
        frames: i64,
        agg_factor: i32,
        bytes_per_phase: u64,
        write_secs: f64,
        read_secs: f64,
        verify_errors: u64,
    ) -> Self {
        let mib = bytes_per_phase as f64 / MEBIBYTE;
        BenchReport {
            ranks,
            io_tasks,
            stride,
            elements_per_rank,
            frames,
            agg_factor,
            bytes_per_phase,
            write_secs,
            write_mib_per_s: if write_secs > 0.0 { mib / write_secs } else { 0.0 },
            read_secs,
            read_mib_per_s: if read_secs > 0.0 { mib / read_secs } else { 0.0 },
            verify_errors,
        }
    }

    pub fn print_text(&self) {
        println!("slabio-bench results");
        println!("  ranks          = {}", self.ranks);
        println!("  io_tasks       = {} (stride {})", self.io_tasks, self.stride);
        println!("  elements/rank  = {}", self.elements_per_rank);
        println!("  frames         = {}", self.frames);
        println!("  agg_factor     = {}", self.agg_factor);
        println!("  bytes/phase    = {}", self.bytes_per_phase);
        println!(
            "  write          = {:.3} s  ({:.1} MiB/s)",
            self.write_secs, self.write_mib_per_s
        );
        println!(
            "  read           = {:.3} s  ({:.1} MiB/s)",
            self.read_secs, self.read_mib_per_s
        );
        if self.verify_errors > 0 {
            println!("  VERIFY ERRORS  = {}", self.verify_errors);
        }
    }
}
