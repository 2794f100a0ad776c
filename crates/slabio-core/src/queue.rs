//! Per-file write queue: the owned synchronisation object around the
//! descriptor FIFO, the writer's active flag, and the writer handle.
//! FIFO fairness between the producing API thread and the consuming
//! writer thread comes from the embedded ticket lock.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::thread::JoinHandle;

use crate::backend::VarId;
use crate::ticket::{TicketGuard, TicketLock};

/// One pending write.
///
/// The descriptor owns `buf` from the moment it is enqueued; the writer
/// keeps the buffer alive until the backend `wait_all` that retires the
/// corresponding request has returned, then drops it.
pub(crate) struct WriteDesc {
    pub var: VarId,
    pub start: Vec<u64>,
    pub count: Vec<u64>,
    pub buf: Vec<u8>,
}

struct QueueState {
    fifo: VecDeque<WriteDesc>,
    active: bool,
}

pub(crate) struct WriteQueue {
    state: Mutex<QueueState>,
    ticket: TicketLock,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl WriteQueue {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                fifo: VecDeque::new(),
                active: false,
            }),
            ticket: TicketLock::new(),
            writer: Mutex::new(None),
        }
    }

    /// Order this caller among the queue's producers and consumer.
    /// Queue and flag mutations below must happen under this guard.
    pub(crate) fn ticket_lock(&self) -> TicketGuard<'_> {
        self.ticket.lock()
    }

    pub(crate) fn push(&self, desc: WriteDesc) {
        self.state.lock().unwrap().fifo.push_back(desc);
    }

    pub(crate) fn pop(&self) -> Option<WriteDesc> {
        self.state.lock().unwrap().fifo.pop_front()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.state.lock().unwrap().fifo.is_empty()
    }

    pub(crate) fn is_active(&self) -> bool {
        self.state.lock().unwrap().active
    }

    pub(crate) fn set_active(&self, active: bool) {
        self.state.lock().unwrap().active = active;
    }

    /// Take the writer handle, leaving `None`; the caller joins it.
    pub(crate) fn take_writer(&self) -> Option<JoinHandle<()>> {
        self.writer.lock().unwrap().take()
    }

    pub(crate) fn store_writer(&self, handle: JoinHandle<()>) {
        *self.writer.lock().unwrap() = Some(handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desc(tag: u8) -> WriteDesc {
        WriteDesc {
            var: VarId(0),
            start: vec![0],
            count: vec![1],
            buf: vec![tag],
        }
    }

    #[test]
    fn test_fifo_order() {
        let q = WriteQueue::new();
        assert!(q.is_empty());
        q.push(desc(1));
        q.push(desc(2));
        q.push(desc(3));
        assert!(!q.is_empty());
        assert_eq!(q.pop().unwrap().buf, vec![1]);
        assert_eq!(q.pop().unwrap().buf, vec![2]);
        assert_eq!(q.pop().unwrap().buf, vec![3]);
        assert!(q.pop().is_none());
    }

    #[test]
    fn test_active_flag() {
        let q = WriteQueue::new();
        assert!(!q.is_active());
        q.set_active(true);
        assert!(q.is_active());
        q.set_active(false);
        assert!(!q.is_active());
    }
}
