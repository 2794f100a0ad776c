//! Property-level checks of the pipeline: transfer symmetry, round-trips
//! over irregular layouts, aggregation invariance, frame isolation, and
//! collective safety under concurrent writers.

mod common;

use common::{be, f64_bytes, f64_from, i32_bytes, i32_from, run_ranks};
use slabio_core::{
    Aggregation, Config, Context, Direction, File, FileMode, VarType, transfer_field,
};

/// Round-robin element ownership: rank r owns every 4th element. The
/// exchange is dense (every compute rank talks to every I/O rank).
#[test]
fn test_roundtrip_interleaved_layout() {
    run_ranks(4, |comm, backend| {
        let ctx = Context::init(&comm, 2, 2, Config::default()).unwrap();
        let rank = ctx.rank() as u64;
        let elems: Vec<u64> = (0..6).map(|i| rank + 4 * i).collect();
        let values: Vec<f64> = elems.iter().map(|&e| e as f64 * 0.5).collect();

        let mut file = File::open(&ctx, be(&backend), "rr.nc", FileMode::CREATE).unwrap();
        file.define_dim("n", Some(24)).unwrap();
        file.define_var("x", VarType::Real64, &["n"]).unwrap();
        let decomp = ctx.create_decomp(&elems).unwrap();
        file.put_var("x", Some(&decomp), &f64_bytes(&values)).unwrap();
        file.sync().unwrap();

        let mut out = vec![0u8; values.len() * 8];
        file.get_var("x", Some(&decomp), &mut out).unwrap();
        assert_eq!(f64_from(&out), values);

        // The file itself is ordered by global index.
        let mut all = vec![0u8; 24 * 8];
        file.get_var("x", None, &mut all).unwrap();
        let expect: Vec<f64> = (0..24).map(|e| e as f64 * 0.5).collect();
        assert_eq!(f64_from(&all), expect);
        file.close().unwrap();
    });
}

/// `transfer_field` there-and-back is the identity on the compute buffer.
#[test]
fn test_transfer_symmetry() {
    run_ranks(4, |comm, _backend| {
        let ctx = Context::init(&comm, 2, 2, Config::default()).unwrap();
        let rank = ctx.rank() as u64;
        // Uneven counts: rank r owns r+1 elements.
        let first: u64 = (0..rank).map(|r| r + 1).sum();
        let elems: Vec<u64> = (0..=rank).map(|i| first + i).collect();
        let decomp = ctx.create_decomp(&elems).unwrap();

        let src: Vec<u8> = elems.iter().flat_map(|&e| (e as i32).to_le_bytes()).collect();
        let mut slab = vec![0u8; decomp.io_count() as usize * 4];
        transfer_field(&decomp, Direction::CompToIo, 4, &src, &mut slab).unwrap();

        // The slab holds the rank's contiguous global range, in order.
        let got = i32_from(&slab);
        let expect: Vec<i32> = (0..decomp.io_count()).map(|i| (decomp.io_start() + i) as i32).collect();
        assert_eq!(got, expect);

        let mut back = vec![0u8; src.len()];
        transfer_field(&decomp, Direction::IoToComp, 4, &slab, &mut back).unwrap();
        assert_eq!(back, src);
    });
}

/// Changing the aggregation factor must not change file contents.
#[test]
fn test_aggregation_invariance() {
    run_ranks(4, |comm, backend| {
        let mut contents = Vec::new();
        for (tag, factor) in [("agg0", 0), ("agg2", 2), ("agg4", 4)] {
            let mut config = Config::default();
            config.agg_factor = factor;
            let ctx = Context::init(&comm, 2, 2, config).unwrap();
            let rank = ctx.rank() as u64;
            let elems: Vec<u64> = (0..5).map(|i| rank + 4 * i).collect();
            let values: Vec<f64> = elems.iter().map(|&e| (e * e) as f64).collect();

            let path = format!("{tag}.nc");
            let mut file = File::open(&ctx, be(&backend), &path, FileMode::CREATE).unwrap();
            file.define_dim("n", Some(20)).unwrap();
            file.define_var("x", VarType::Real64, &["n"]).unwrap();
            let decomp = ctx.create_decomp(&elems).unwrap();
            match (factor, decomp.aggregation()) {
                (0, Aggregation::Disabled) => {}
                (_, Aggregation::Grouped(plan)) => {
                    // Sub-group leaders hold everything, members nothing.
                    if plan.is_leader() {
                        assert_eq!(plan.n_compute_agg(), plan.counts().iter().sum::<usize>());
                        assert_eq!(plan.displs().len(), plan.counts().len());
                    } else {
                        assert_eq!(plan.n_compute_agg(), 0);
                    }
                }
                _ => panic!("unexpected aggregation variant"),
            }
            file.put_var("x", Some(&decomp), &f64_bytes(&values)).unwrap();
            file.sync().unwrap();

            let mut all = vec![0u8; 20 * 8];
            file.get_var("x", None, &mut all).unwrap();
            contents.push(all);

            // And the decomposed read path agrees under aggregation too.
            let mut out = vec![0u8; values.len() * 8];
            file.get_var("x", Some(&decomp), &mut out).unwrap();
            assert_eq!(f64_from(&out), values);
            file.close().unwrap();
        }
        assert_eq!(contents[0], contents[1]);
        assert_eq!(contents[0], contents[2]);
    });
}

/// Writes at one frame leave other frames untouched.
#[test]
fn test_frame_isolation() {
    run_ranks(2, |comm, backend| {
        let ctx = Context::init(&comm, 1, 2, Config::default()).unwrap();
        let rank = ctx.rank() as u64;
        let elems = [2 * rank, 2 * rank + 1];

        let mut file = File::open(&ctx, be(&backend), "frames.nc", FileMode::CREATE).unwrap();
        file.define_dim("time", None).unwrap();
        file.define_dim("n", Some(4)).unwrap();
        file.define_var("v", VarType::Int32, &["time", "n"]).unwrap();
        let decomp = ctx.create_decomp(&elems).unwrap();

        let frame0: Vec<i32> = elems.iter().map(|&e| e as i32).collect();
        file.put_var("v", Some(&decomp), &i32_bytes(&frame0)).unwrap();
        file.set_frame(1).unwrap();
        file.put_var("v", Some(&decomp), &i32_bytes(&[7, 7])).unwrap();
        // Overwrite frame 1 again; frame 0 must keep its contents.
        file.put_var("v", Some(&decomp), &i32_bytes(&[9, 9])).unwrap();
        file.sync().unwrap();

        let mut out = vec![0u8; 8];
        file.set_frame(0).unwrap();
        file.get_var("v", Some(&decomp), &mut out).unwrap();
        assert_eq!(i32_from(&out), frame0);
        file.set_frame(1).unwrap();
        file.get_var("v", Some(&decomp), &mut out).unwrap();
        assert_eq!(i32_from(&out), vec![9, 9]);
        file.close().unwrap();
    });
}

/// Identical per-file call sequences with staggered rank timing: the
/// writers' unanimity protocol must keep making progress (the test
/// completing without deadlock is the property).
#[test]
fn test_collective_safety_with_staggered_ranks() {
    run_ranks(4, |comm, backend| {
        let ctx = Context::init(&comm, 4, 1, Config::default()).unwrap();
        let rank = ctx.rank() as u64;
        let elems = [rank];

        let mut file = File::open(&ctx, be(&backend), "stagger.nc", FileMode::CREATE).unwrap();
        file.define_dim("time", None).unwrap();
        file.define_dim("n", Some(4)).unwrap();
        file.define_var("v", VarType::Real64, &["time", "n"]).unwrap();
        let decomp = ctx.create_decomp(&elems).unwrap();

        for frame in 0..40u64 {
            // Skew the ranks so local queue lengths genuinely differ.
            std::thread::sleep(std::time::Duration::from_micros(rank * 200));
            file.set_frame(frame as i64).unwrap();
            file.put_var("v", Some(&decomp), &f64_bytes(&[(frame * 10 + rank) as f64]))
                .unwrap();
        }
        file.sync().unwrap();

        for frame in [0u64, 17, 39] {
            file.set_frame(frame as i64).unwrap();
            let mut out = vec![0u8; 8];
            file.get_var("v", Some(&decomp), &mut out).unwrap();
            assert_eq!(f64_from(&out), vec![(frame * 10 + rank) as f64]);
        }
        file.close().unwrap();
    });
}

/// A variable with a trailing non-decomposed dimension moves whole rows
/// per element.
#[test]
fn test_inner_dimension_rows() {
    run_ranks(2, |comm, backend| {
        let ctx = Context::init(&comm, 2, 1, Config::default()).unwrap();
        let rank = ctx.rank() as u64;
        let elems = [rank, 2 + rank];

        let mut file = File::open(&ctx, be(&backend), "rows.nc", FileMode::CREATE).unwrap();
        file.define_dim("cell", Some(4)).unwrap();
        file.define_dim("level", Some(3)).unwrap();
        file.define_var("t", VarType::Int32, &["cell", "level"]).unwrap();
        let decomp = ctx.create_decomp(&elems).unwrap();

        // Element e carries the row [e*10, e*10+1, e*10+2].
        let values: Vec<i32> = elems
            .iter()
            .flat_map(|&e| (0..3).map(move |l| (e * 10 + l) as i32))
            .collect();
        file.put_var("t", Some(&decomp), &i32_bytes(&values)).unwrap();
        file.sync().unwrap();

        let mut all = vec![0u8; 4 * 3 * 4];
        file.get_var("t", None, &mut all).unwrap();
        let expect: Vec<i32> = (0..4).flat_map(|e| (0..3).map(move |l| e * 10 + l)).collect();
        assert_eq!(i32_from(&all), expect);

        let mut out = vec![0u8; values.len() * 4];
        file.get_var("t", Some(&decomp), &mut out).unwrap();
        assert_eq!(i32_from(&out), values);
        file.close().unwrap();
    });
}
