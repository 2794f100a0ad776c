//! In-process transport: N ranks are N threads of one process.
//!
//! Every collective is a rendezvous on a shared round object: each rank
//! deposits its contribution, the last arrival combines all contributions
//! into per-rank shares, and ranks depart with their share. A two-phase
//! (collect/drain) discipline lets a fast rank re-enter the next
//! collective while slow ranks are still draining the previous one.
//!
//! Contributions are self-describing: a combine step only ever reads the
//! deposited bytes plus call-uniform arguments (root, operator), never
//! rank-local state, because exactly one rank executes it.

use std::collections::BTreeMap;
use std::sync::{Arc, Condvar, Mutex};

use crate::comm::{Comm, ReduceOp};
use crate::error::{Error, Result};

/// One rank's handle onto an in-process communicator.
pub struct ThreadComm {
    state: Arc<CommState>,
    rank: i32,
}

struct CommState {
    size: i32,
    round: Mutex<Round>,
    cv: Condvar,
}

#[derive(PartialEq, Eq, Clone, Copy)]
enum Phase {
    Collecting,
    Draining,
}

enum Share {
    None,
    Bytes(Vec<u8>),
    Comm(Arc<CommState>, i32),
}

struct Round {
    phase: Phase,
    arrived: usize,
    departed: usize,
    slots: Vec<Vec<u8>>,
    shares: Vec<Share>,
}

impl CommState {
    fn new(size: i32) -> Arc<CommState> {
        let n = size as usize;
        Arc::new(CommState {
            size,
            round: Mutex::new(Round {
                phase: Phase::Collecting,
                arrived: 0,
                departed: 0,
                slots: (0..n).map(|_| Vec::new()).collect(),
                shares: (0..n).map(|_| Share::None).collect(),
            }),
            cv: Condvar::new(),
        })
    }
}

impl ThreadComm {
    /// Create the handles for a `size`-rank world, one per rank thread.
    pub fn world(size: i32) -> Vec<ThreadComm> {
        assert!(size >= 1, "world size must be at least 1");
        let state = CommState::new(size);
        (0..size)
            .map(|rank| ThreadComm {
                state: Arc::clone(&state),
                rank,
            })
            .collect()
    }

    /// Rendezvous: deposit `mine`, let the last arrival run `combine`
    /// over all contributions, return this rank's share.
    fn exchange(
        &self,
        mine: Vec<u8>,
        combine: impl FnOnce(&mut [Vec<u8>]) -> Vec<Share>,
    ) -> Share {
        let st = &self.state;
        let n = st.size as usize;
        let me = self.rank as usize;

        let mut r = st.round.lock().unwrap();
        while r.phase != Phase::Collecting {
            r = st.cv.wait(r).unwrap();
        }
        r.slots[me] = mine;
        r.arrived += 1;
        if r.arrived == n {
            let mut slots = std::mem::replace(&mut r.slots, (0..n).map(|_| Vec::new()).collect());
            r.shares = combine(&mut slots);
            debug_assert_eq!(r.shares.len(), n);
            r.phase = Phase::Draining;
            st.cv.notify_all();
        } else {
            while r.phase != Phase::Draining {
                r = st.cv.wait(r).unwrap();
            }
        }
        let share = std::mem::replace(&mut r.shares[me], Share::None);
        r.departed += 1;
        if r.departed == n {
            r.arrived = 0;
            r.departed = 0;
            r.phase = Phase::Collecting;
            st.cv.notify_all();
        }
        share
    }

    fn exchange_bytes(
        &self,
        mine: Vec<u8>,
        combine: impl FnOnce(&mut [Vec<u8>]) -> Vec<Share>,
    ) -> Result<Vec<u8>> {
        match self.exchange(mine, combine) {
            Share::Bytes(b) => Ok(b),
            _ => Err(Error::Mpi("collective produced no payload".into())),
        }
    }
}

fn replicate(bytes: &[u8], n: usize) -> Vec<Share> {
    (0..n).map(|_| Share::Bytes(bytes.to_vec())).collect()
}

impl Comm for ThreadComm {
    fn rank(&self) -> i32 {
        self.rank
    }

    fn size(&self) -> i32 {
        self.state.size
    }

    fn duplicate(&self) -> Result<Arc<dyn Comm>> {
        // A dup is a split where every rank keeps its position.
        self.split(0, self.rank)
    }

    fn split(&self, color: i32, key: i32) -> Result<Arc<dyn Comm>> {
        let mut mine = Vec::with_capacity(8);
        mine.extend_from_slice(&color.to_le_bytes());
        mine.extend_from_slice(&key.to_le_bytes());
        let share = self.exchange(mine, |slots| {
            // Group (color, key, old rank) triples by colour; each group
            // becomes a fresh communicator ordered by (key, old rank).
            let mut groups: BTreeMap<i32, Vec<(i32, usize)>> = BTreeMap::new();
            for (old_rank, slot) in slots.iter().enumerate() {
                let c = i32::from_le_bytes(slot[0..4].try_into().unwrap());
                let k = i32::from_le_bytes(slot[4..8].try_into().unwrap());
                groups.entry(c).or_default().push((k, old_rank));
            }
            let mut shares: Vec<Share> = (0..slots.len()).map(|_| Share::None).collect();
            for members in groups.values_mut() {
                members.sort();
                let state = CommState::new(members.len() as i32);
                for (new_rank, &(_, old_rank)) in members.iter().enumerate() {
                    shares[old_rank] = Share::Comm(Arc::clone(&state), new_rank as i32);
                }
            }
            shares
        });
        match share {
            Share::Comm(state, rank) => Ok(Arc::new(ThreadComm { state, rank })),
            _ => Err(Error::Mpi("split produced no communicator".into())),
        }
    }

    fn all_reduce_i64(&self, value: i64, op: ReduceOp) -> Result<i64> {
        let n = self.state.size as usize;
        let out = self.exchange_bytes(value.to_le_bytes().to_vec(), move |slots| {
            let mut acc: Option<i64> = None;
            for slot in slots.iter() {
                let v = i64::from_le_bytes(slot[0..8].try_into().unwrap());
                acc = Some(match acc {
                    None => v,
                    Some(a) => op.apply(a, v),
                });
            }
            replicate(&acc.unwrap().to_le_bytes(), n)
        })?;
        Ok(i64::from_le_bytes(out[0..8].try_into().unwrap()))
    }

    fn broadcast(&self, root: i32, buf: &mut [u8]) -> Result<()> {
        check_rank(root, self.state.size)?;
        let n = self.state.size as usize;
        let mine = if self.rank == root { buf.to_vec() } else { Vec::new() };
        let out = self.exchange_bytes(mine, move |slots| {
            let payload = std::mem::take(&mut slots[root as usize]);
            replicate(&payload, n)
        })?;
        if out.len() != buf.len() {
            return Err(Error::Mpi("broadcast length mismatch".into()));
        }
        buf.copy_from_slice(&out);
        Ok(())
    }

    fn gather_i64(&self, root: i32, value: i64) -> Result<Vec<i64>> {
        check_rank(root, self.state.size)?;
        let n = self.state.size as usize;
        let out = self.exchange_bytes(value.to_le_bytes().to_vec(), move |slots| {
            let mut packed = Vec::with_capacity(n * 8);
            for slot in slots.iter() {
                packed.extend_from_slice(&slot[0..8]);
            }
            let mut shares: Vec<Share> = (0..n).map(|_| Share::Bytes(Vec::new())).collect();
            shares[root as usize] = Share::Bytes(packed);
            shares
        })?;
        Ok(out
            .chunks_exact(8)
            .map(|c| i64::from_le_bytes(c.try_into().unwrap()))
            .collect())
    }

    fn gather_v(
        &self,
        root: i32,
        send: &[u8],
        recv_counts: &[usize],
        recv: &mut [u8],
    ) -> Result<()> {
        check_rank(root, self.state.size)?;
        let n = self.state.size as usize;
        if self.rank == root {
            if recv_counts.len() != n {
                return Err(Error::Mpi("gather_v count vector length mismatch".into()));
            }
            if recv_counts.iter().sum::<usize>() != recv.len() {
                return Err(Error::Mpi("gather_v receive buffer length mismatch".into()));
            }
        }
        let out = self.exchange_bytes(send.to_vec(), move |slots| {
            let mut packed = Vec::new();
            for slot in slots.iter() {
                packed.extend_from_slice(slot);
            }
            let mut shares: Vec<Share> = (0..n).map(|_| Share::Bytes(Vec::new())).collect();
            shares[root as usize] = Share::Bytes(packed);
            shares
        })?;
        if self.rank == root {
            if out.len() != recv.len() {
                return Err(Error::Mpi("gather_v total length mismatch".into()));
            }
            recv.copy_from_slice(&out);
        }
        Ok(())
    }

    fn scatter_v(
        &self,
        root: i32,
        send: &[u8],
        send_counts: &[usize],
        recv: &mut [u8],
    ) -> Result<()> {
        check_rank(root, self.state.size)?;
        let n = self.state.size as usize;
        // The root's contribution is self-describing: counts, then data.
        let mine = if self.rank == root {
            if send_counts.len() != n {
                return Err(Error::Mpi("scatter_v count vector length mismatch".into()));
            }
            if send_counts.iter().sum::<usize>() != send.len() {
                return Err(Error::Mpi("scatter_v send buffer length mismatch".into()));
            }
            let mut m = Vec::with_capacity(n * 8 + send.len());
            for &c in send_counts {
                m.extend_from_slice(&(c as u64).to_le_bytes());
            }
            m.extend_from_slice(send);
            m
        } else {
            Vec::new()
        };
        let out = self.exchange_bytes(mine, move |slots| {
            let packed = std::mem::take(&mut slots[root as usize]);
            let mut shares = Vec::with_capacity(n);
            let mut off = n * 8;
            for i in 0..n {
                let c = u64::from_le_bytes(packed[i * 8..(i + 1) * 8].try_into().unwrap()) as usize;
                shares.push(Share::Bytes(packed[off..off + c].to_vec()));
                off += c;
            }
            shares
        })?;
        if out.len() != recv.len() {
            return Err(Error::Mpi("scatter_v receive buffer length mismatch".into()));
        }
        recv.copy_from_slice(&out);
        Ok(())
    }

    fn all_to_all_v(
        &self,
        send: &[u8],
        send_counts: &[usize],
        recv: &mut [u8],
        recv_counts: &[usize],
    ) -> Result<()> {
        let n = self.state.size as usize;
        if send_counts.len() != n || recv_counts.len() != n {
            return Err(Error::Mpi("all_to_all_v count vector length mismatch".into()));
        }
        if send_counts.iter().sum::<usize>() != send.len() {
            return Err(Error::Mpi("all_to_all_v send buffer length mismatch".into()));
        }
        if recv_counts.iter().sum::<usize>() != recv.len() {
            return Err(Error::Mpi("all_to_all_v receive buffer length mismatch".into()));
        }
        // Contribution: per-destination counts, then the packed blocks.
        let mut mine = Vec::with_capacity(n * 8 + send.len());
        for &c in send_counts {
            mine.extend_from_slice(&(c as u64).to_le_bytes());
        }
        mine.extend_from_slice(send);
        let out = self.exchange_bytes(mine, move |slots| {
            // Block for destination d from source s starts at s's header
            // offset for d.
            let mut offsets: Vec<Vec<usize>> = Vec::with_capacity(n);
            for slot in slots.iter() {
                let mut offs = Vec::with_capacity(n + 1);
                let mut off = n * 8;
                for d in 0..n {
                    offs.push(off);
                    let c =
                        u64::from_le_bytes(slot[d * 8..(d + 1) * 8].try_into().unwrap()) as usize;
                    off += c;
                }
                offs.push(off);
                offsets.push(offs);
            }
            (0..n)
                .map(|dest| {
                    let mut block = Vec::new();
                    for (src, slot) in slots.iter().enumerate() {
                        let lo = offsets[src][dest];
                        let hi = offsets[src][dest + 1];
                        block.extend_from_slice(&slot[lo..hi]);
                    }
                    Share::Bytes(block)
                })
                .collect()
        })?;
        if out.len() != recv.len() {
            return Err(Error::Mpi("all_to_all_v total length mismatch".into()));
        }
        recv.copy_from_slice(&out);
        Ok(())
    }
}

fn check_rank(rank: i32, size: i32) -> Result<()> {
    if rank < 0 || rank >= size {
        return Err(Error::Mpi(format!("rank {rank} out of range for size {size}")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    /// Run `f` on every rank of a fresh `n`-thread world.
    fn with_world<F>(n: i32, f: F)
    where
        F: Fn(ThreadComm) + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        let handles: Vec<_> = ThreadComm::world(n)
            .into_iter()
            .map(|comm| {
                let f = Arc::clone(&f);
                thread::spawn(move || f(comm))
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
    }

    #[test]
    fn test_all_reduce_ops() {
        with_world(4, |comm| {
            let r = comm.rank() as i64;
            assert_eq!(comm.all_reduce_i64(r, ReduceOp::Sum).unwrap(), 6);
            assert_eq!(comm.all_reduce_i64(r, ReduceOp::Max).unwrap(), 3);
            assert_eq!(comm.all_reduce_i64(r, ReduceOp::Min).unwrap(), 0);
        });
    }

    #[test]
    fn test_broadcast() {
        with_world(3, |comm| {
            let mut buf = if comm.rank() == 1 {
                vec![7u8, 8, 9]
            } else {
                vec![0u8; 3]
            };
            comm.broadcast(1, &mut buf).unwrap();
            assert_eq!(buf, vec![7, 8, 9]);
        });
    }

    #[test]
    fn test_gather_and_scatter() {
        with_world(3, |comm| {
            let rank = comm.rank();
            let gathered = comm.gather_i64(0, rank as i64 * 10).unwrap();
            if rank == 0 {
                assert_eq!(gathered, vec![0, 10, 20]);
            } else {
                assert!(gathered.is_empty());
            }

            // Scatter rank-sized blocks 0 -> [0], 1 -> [1,1], 2 -> [2,2,2].
            let (send, counts) = if rank == 0 {
                (vec![0u8, 1, 1, 2, 2, 2], vec![1usize, 2, 3])
            } else {
                (Vec::new(), Vec::new())
            };
            let mut recv = vec![0xffu8; rank as usize + 1];
            comm.scatter_v(0, &send, &counts, &mut recv).unwrap();
            assert!(recv.iter().all(|&b| b == rank as u8));
        });
    }

    #[test]
    fn test_all_to_all_v() {
        with_world(2, |comm| {
            let rank = comm.rank() as u8;
            // Rank r sends one byte (r*2 + dest) to each destination.
            let send = vec![rank * 2, rank * 2 + 1];
            let counts = vec![1usize, 1];
            let mut recv = vec![0u8; 2];
            comm.all_to_all_v(&send, &counts, &mut recv, &counts).unwrap();
            // Receive from each source its block addressed to us.
            assert_eq!(recv, vec![rank, 2 + rank]);
        });
    }

    #[test]
    fn test_split_groups_and_keys() {
        with_world(6, |comm| {
            let rank = comm.rank();
            // Two groups of three; reverse the key order inside each group.
            let sub = comm.split(rank % 2, -rank).unwrap();
            assert_eq!(sub.size(), 3);
            let expect = match rank {
                0 | 1 => 2,
                2 | 3 => 1,
                _ => 0,
            };
            assert_eq!(sub.rank(), expect);
            // The sub-communicator must carry its own collective schedule.
            let sum = sub.all_reduce_i64(1, ReduceOp::Sum).unwrap();
            assert_eq!(sum, 3);
        });
    }

    #[test]
    fn test_duplicate_preserves_rank() {
        with_world(3, |comm| {
            let dup = comm.duplicate().unwrap();
            assert_eq!(dup.rank(), comm.rank());
            assert_eq!(dup.size(), comm.size());
        });
    }

    #[test]
    fn test_back_to_back_collectives() {
        with_world(4, |comm| {
            for i in 0..50 {
                let s = comm.all_reduce_i64(i, ReduceOp::Sum).unwrap();
                assert_eq!(s, 4 * i);
            }
        });
    }
}
