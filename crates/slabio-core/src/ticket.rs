use std::sync::{Condvar, Mutex};

/// FIFO-fair mutual exclusion.
///
/// Each acquirer draws a ticket and is served strictly in ticket order,
/// so a flood of short producers cannot starve the consumer (or the
/// other way around). Parking is condvar-based.
pub(crate) struct TicketLock {
    state: Mutex<Tickets>,
    cv: Condvar,
}

struct Tickets {
    next: u64,
    serving: u64,
}

pub(crate) struct TicketGuard<'a> {
    lock: &'a TicketLock,
}

impl TicketLock {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(Tickets { next: 0, serving: 0 }),
            cv: Condvar::new(),
        }
    }

    /// Block until this caller's ticket is served.
    pub(crate) fn lock(&self) -> TicketGuard<'_> {
        let mut t = self.state.lock().unwrap();
        let me = t.next;
        t.next += 1;
        while t.serving != me {
            t = self.cv.wait(t).unwrap();
        }
        TicketGuard { lock: self }
    }
}

impl Drop for TicketGuard<'_> {
    fn drop(&mut self) {
        let mut t = self.lock.state.lock().unwrap();
        t.serving += 1;
        // Wake every waiter; only the holder of the next ticket proceeds.
        self.lock.cv.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::thread;

    #[test]
    fn test_mutual_exclusion() {
        let lock = Arc::new(TicketLock::new());
        let counter = Arc::new(AtomicU64::new(0));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let lock = Arc::clone(&lock);
            let counter = Arc::clone(&counter);
            handles.push(thread::spawn(move || {
                for _ in 0..1000 {
                    let _g = lock.lock();
                    let v = counter.load(Ordering::Relaxed);
                    counter.store(v + 1, Ordering::Relaxed);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(counter.load(Ordering::Relaxed), 8000);
    }

    #[test]
    fn test_fifo_order() {
        // Hold the lock, queue three waiters with distinct arrival times,
        // then check they are served in arrival order.
        let lock = Arc::new(TicketLock::new());
        let order = Arc::new(Mutex::new(Vec::new()));

        let gate = lock.lock();
        let mut handles = Vec::new();
        for id in 0..3 {
            let lock = Arc::clone(&lock);
            let order = Arc::clone(&order);
            handles.push(thread::spawn(move || {
                let _g = lock.lock();
                order.lock().unwrap().push(id);
            }));
            // Give the spawned thread time to draw its ticket.
            thread::sleep(std::time::Duration::from_millis(50));
        }
        drop(gate);
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }
}
