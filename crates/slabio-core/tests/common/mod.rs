use std::sync::Arc;

use slabio_backend_mem::MemBackend;
use slabio_core::{IoBackend, ThreadComm};

/// Run `f` on every rank of a fresh in-process world sharing one
/// in-memory backend.
pub fn run_ranks<F>(n: i32, f: F) -> Arc<MemBackend>
where
    F: Fn(ThreadComm, Arc<MemBackend>) + Send + Sync + 'static,
{
    let backend = Arc::new(MemBackend::new());
    let f = Arc::new(f);
    let handles: Vec<_> = ThreadComm::world(n)
        .into_iter()
        .map(|comm| {
            let f = Arc::clone(&f);
            let backend = Arc::clone(&backend);
            std::thread::spawn(move || f(comm, backend))
        })
        .collect();
    let mut failed = 0;
    for h in handles {
        if h.join().is_err() {
            failed += 1;
        }
    }
    assert_eq!(failed, 0, "{failed} rank thread(s) panicked");
    backend
}

/// Upcast for `File::open`.
pub fn be(backend: &Arc<MemBackend>) -> Arc<dyn IoBackend> {
    Arc::clone(backend) as Arc<dyn IoBackend>
}

pub fn f64_bytes(values: &[f64]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

pub fn f64_from(bytes: &[u8]) -> Vec<f64> {
    bytes
        .chunks_exact(8)
        .map(|c| f64::from_le_bytes(c.try_into().unwrap()))
        .collect()
}

pub fn i32_bytes(values: &[i32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

pub fn i32_from(bytes: &[u8]) -> Vec<i32> {
    bytes
        .chunks_exact(4)
        .map(|c| i32::from_le_bytes(c.try_into().unwrap()))
        .collect()
}
