//! The state-safe interrupt queue (§4.7): the sole path for mutating engine
//! identity (a JIT swap) or other cross-engine state. Enqueue is callable
//! from any thread, including `Interface` callbacks and backend worker
//! threads; `drain` runs only under the scheduler's exclusive ownership of
//! every engine, between simulation steps.

use std::collections::VecDeque;
use std::sync::Mutex;

/// A unit of work requiring exclusive access to engine state, run only from
/// within [`InterruptQueue::drain`].
pub type Interrupt = Box<dyn FnOnce() + Send>;

/// A FIFO of pending state-safe interrupts.
#[derive(Default)]
pub struct InterruptQueue {
    pending: Mutex<VecDeque<Interrupt>>,
}

impl InterruptQueue {
    /// An empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue `f` to run at the next drain. Non-blocking; callable from any thread.
    pub fn schedule(&self, f: impl FnOnce() + Send + 'static) {
        self.pending
            .lock()
            .expect("interrupt queue mutex poisoned")
            .push_back(Box::new(f));
    }

    /// True iff no interrupts are currently queued.
    pub fn is_empty(&self) -> bool {
        self.pending.lock().expect("interrupt queue mutex poisoned").is_empty()
    }

    /// Run every interrupt queued as of this call, in FIFO order. An
    /// interrupt that itself schedules further interrupts does not see them
    /// run in this drain; they wait for the next one, bounding work per step.
    pub fn drain(&self) {
        let batch: Vec<Interrupt> = {
            let mut guard = self.pending.lock().expect("interrupt queue mutex poisoned");
            guard.drain(..).collect()
        };
        for interrupt in batch {
            interrupt();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn interrupts_run_in_fifo_order() {
        let queue = InterruptQueue::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..5 {
            let order = Arc::clone(&order);
            queue.schedule(move || order.lock().unwrap().push(i));
        }
        queue.drain();
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn interrupt_scheduled_during_drain_waits_for_next_drain() {
        let queue = Arc::new(InterruptQueue::new());
        let count = Arc::new(AtomicUsize::new(0));

        let inner_queue = Arc::clone(&queue);
        let inner_count = Arc::clone(&count);
        queue.schedule(move || {
            inner_count.fetch_add(1, Ordering::SeqCst);
            let re_entrant_count = Arc::clone(&inner_count);
            inner_queue.schedule(move || {
                re_entrant_count.fetch_add(1, Ordering::SeqCst);
            });
        });

        queue.drain();
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!queue.is_empty());

        queue.drain();
        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert!(queue.is_empty());
    }

    #[test]
    fn empty_drain_is_a_no_op() {
        let queue = InterruptQueue::new();
        queue.drain();
        assert!(queue.is_empty());
    }
}
