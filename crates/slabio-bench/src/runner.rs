use std::sync::Arc;
use std::thread;
use std::time::Instant;

use slabio_backend_mem::MemBackend;
use slabio_core::{
    Comm, Config, Context, File, FileMode, IoBackend, ReduceOp, ThreadComm, VarType,
};

use crate::cli::CliArgs;
use crate::report::BenchReport;

/// Run the benchmark: spawn one thread per rank over the in-process
/// transport, write `frames` record frames through the async pipeline,
/// read them back, and reduce the timings to rank 0.
pub fn run(args: &CliArgs) -> BenchReport {
    let backend = Arc::new(MemBackend::new());
    let args = Arc::new(args.clone());

    let handles: Vec<_> = ThreadComm::world(args.ranks)
        .into_iter()
        .map(|comm| {
            let backend = Arc::clone(&backend);
            let args = Arc::clone(&args);
            thread::spawn(move || run_rank(comm, backend, &args))
        })
        .collect();

    let mut report = None;
    for h in handles {
        if let Some(r) = h.join().expect("rank thread panicked") {
            report = Some(r);
        }
    }
    report.expect("rank 0 produced no report")
}

fn expected_value(frame: i64, element: u64) -> f64 {
    frame as f64 * 1e9 + element as f64
}

fn run_rank(comm: ThreadComm, backend: Arc<MemBackend>, args: &CliArgs) -> Option<BenchReport> {
    let config = Config {
        n_reqs: args.n_reqs,
        buf_size: args.buf_size,
        agg_factor: args.agg_factor,
        writer_cpus: Vec::new(),
    };
    let io_tasks = (args.ranks + args.stride - 1) / args.stride;
    let ctx = Context::init(&comm, io_tasks, args.stride, config).expect("context init failed");
    let rank = ctx.rank() as u64;
    let total_elements = args.elements * args.ranks as u64;

    let elems: Vec<u64> = (0..args.elements).map(|i| rank * args.elements + i).collect();
    let backend_dyn: Arc<dyn IoBackend> = backend;

    // === WRITE PHASE ===
    let write_start = Instant::now();
    let mut file =
        File::open(&ctx, Arc::clone(&backend_dyn), &args.path, FileMode::CREATE).unwrap();
    file.define_dim("time", None).unwrap();
    file.define_dim("cell", Some(total_elements)).unwrap();
    file.define_var("field", VarType::Real64, &["time", "cell"]).unwrap();
    let decomp = ctx.create_decomp(&elems).unwrap();

    let mut buf = vec![0u8; elems.len() * 8];
    for frame in 0..args.frames {
        file.set_frame(frame).unwrap();
        for (i, &e) in elems.iter().enumerate() {
            buf[i * 8..(i + 1) * 8].copy_from_slice(&expected_value(frame, e).to_le_bytes());
        }
        file.put_var("field", Some(&decomp), &buf).unwrap();
    }
    file.sync().unwrap();
    let write_ns = write_start.elapsed().as_nanos() as i64;

    // === READ PHASE ===
    let read_start = Instant::now();
    let mut errors = 0u64;
    let mut out = vec![0u8; elems.len() * 8];
    for frame in 0..args.frames {
        file.set_frame(frame).unwrap();
        file.get_var("field", Some(&decomp), &mut out).unwrap();
        for (i, &e) in elems.iter().enumerate() {
            let got = f64::from_le_bytes(out[i * 8..(i + 1) * 8].try_into().unwrap());
            if got != expected_value(frame, e) {
                errors += 1;
            }
        }
    }
    let read_ns = read_start.elapsed().as_nanos() as i64;
    file.close().unwrap();

    // Slowest rank defines the phase time; errors sum over ranks.
    let write_ns = comm.all_reduce_i64(write_ns, ReduceOp::Max).unwrap();
    let read_ns = comm.all_reduce_i64(read_ns, ReduceOp::Max).unwrap();
    let errors = comm.all_reduce_i64(errors as i64, ReduceOp::Sum).unwrap() as u64;

    if ctx.rank() == 0 {
        let bytes = total_elements * 8 * args.frames as u64;
        Some(BenchReport::new(
            args.ranks,
            io_tasks,
            args.stride,
            args.elements,
            args.frames,
            args.agg_factor,
            bytes,
            write_ns as f64 / 1e9,
            read_ns as f64 / 1e9,
            errors,
        ))
    } else {
        None
    }
}
