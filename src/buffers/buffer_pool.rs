use std::cell::{Cell, RefCell};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace, warn};
use crate::buffers::fixed_buffer::FixedBuf;

/// A free list of fixed-size buffers, shared by all connections of a peer. Buffers are handed out
///  by value, so whoever holds a buffer owns it exclusively until it is `put` back.
///
/// The pool pre-allocates `start_size` buffers and grows on demand. It keeps at most `max_size`
///  buffers; buffers returned in excess of that are dropped. Going over `max_size` is not an error,
///  but it is logged since it points to a leak or an undersized pool.
///
/// NB: This is not thread safe, the pool is meant to be shared through an `Rc` inside a single
///      peer's thread.
pub struct BufferPool {
    buf_size: usize,
    max_size: usize,
    buffers: RefCell<Vec<FixedBuf>>,
    created: Cell<usize>,
    last_capacity_warning: Cell<Option<Instant>>,
}

impl BufferPool {
    const CAPACITY_WARNING_INTERVAL: Duration = Duration::from_secs(10);

    pub fn new(buf_size: usize, start_size: usize, max_size: usize) -> anyhow::Result<BufferPool> {
        if start_size > max_size {
            anyhow::bail!("buffer pool start size {} is bigger than max size {}", start_size, max_size);
        }

        let mut buffers = Vec::with_capacity(max_size.min(1024));
        for _ in 0..start_size {
            buffers.push(FixedBuf::new(buf_size));
        }

        Ok(BufferPool {
            buf_size,
            max_size,
            buffers: RefCell::new(buffers),
            created: Cell::new(start_size),
            last_capacity_warning: Cell::new(None),
        })
    }

    pub fn buffer_size(&self) -> usize {
        self.buf_size
    }

    /// number of buffers currently held by the pool
    pub fn available(&self) -> usize {
        self.buffers.borrow().len()
    }

    /// number of buffers created by the pool that were not discarded
    pub fn created(&self) -> usize {
        self.created.get()
    }

    pub fn take(&self) -> FixedBuf {
        if let Some(buffer) = self.buffers.borrow_mut().pop() {
            trace!("returning buffer from pool");
            return buffer;
        }

        debug!("no buffer in pool: creating new buffer");
        self.created.set(self.created.get() + 1);
        if self.created.get() >= self.max_size {
            self.log_capacity_warning();
        }
        FixedBuf::new(self.buf_size)
    }

    pub fn put(&self, mut buffer: FixedBuf) {
        assert_eq!(buffer.capacity(), self.buf_size,
                   "returned buffer does not have the regular capacity of {} bytes"
                   , self.buf_size);

        buffer.clear();

        let mut buffers = self.buffers.borrow_mut();
        if buffers.len() < self.max_size {
            trace!("returning buffer to pool");
            buffers.push(buffer);
        }
        else {
            debug!("pool is full: discarding returned buffer");
            self.created.set(self.created.get().saturating_sub(1));
        }
    }

    fn log_capacity_warning(&self) {
        let now = Instant::now();
        let due = match self.last_capacity_warning.get() {
            None => true,
            Some(last) => last + Self::CAPACITY_WARNING_INTERVAL < now,
        };

        if due {
            warn!("buffer pool has created {} buffers, reaching its max size of {} - buffers may not be returned or the pool is too small", self.created.get(), self.max_size);
            self.last_capacity_warning.set(Some(now));
        }
    }
}
