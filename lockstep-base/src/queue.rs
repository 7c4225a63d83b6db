use crossbeam_queue::ArrayQueue;

// All cross-thread handoff in the scheduler happens through these: the
// ready and done queues between the lock-manager thread and the workers,
// and each worker's inbound message queue. Neither end ever blocks; a
// producer that finds the queue full gets its value handed back and
// decides for itself whether to retry or treat the condition as fatal.
//
// There is no ordering guarantee between distinct producers. FIFO per
// (producer, consumer) pair is all the scheduling protocol relies on.
pub struct AtomicQueue<T> {
    inner: ArrayQueue<T>,
}

impl<T> AtomicQueue<T> {
    pub fn new(capacity: usize) -> Self {
        AtomicQueue {
            inner: ArrayQueue::new(capacity),
        }
    }

    pub fn push(&self, val: T) -> std::result::Result<(), T> {
        self.inner.push(val)
    }

    // Spin until the value fits. Only transport-side producers use this;
    // the scheduler threads themselves never block on their own queues.
    pub fn push_blocking(&self, val: T) {
        let mut val = val;
        loop {
            match self.inner.push(val) {
                Ok(()) => return,
                Err(v) => {
                    val = v;
                    std::thread::yield_now();
                }
            }
        }
    }

    pub fn pop(&self) -> Option<T> {
        self.inner.pop()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity()
    }
}
