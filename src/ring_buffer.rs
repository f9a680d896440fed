use crate::error::TransportError;
use crate::sequencer::Sequencer;

/// Fixed-capacity storage addressed by sequence number (modulo capacity). Besides FIFO access
///  through `enqueue` / `try_dequeue`, slots can be inserted and removed out of order, which is
///  what reorder buffers and ack tracking need.
///
/// `read` and `write` are sequence numbers in the buffer's sequence space. The buffer is full
///  when `write` is one behind `read`, i.e. one slot always stays unused.
pub struct RingBuffer<T> {
    sequencer: Sequencer,
    buffer: Vec<Option<T>>,
    read: u64,
    write: u64,
    count: usize,
}

impl<T> RingBuffer<T> {
    pub fn new(bits: u32) -> Result<RingBuffer<T>, TransportError> {
        let sequencer = Sequencer::new(bits)?;
        if bits > 24 {
            return Err(TransportError::invalid_argument("bits", format!("ring buffer of 2^{} slots is too big", bits)));
        }

        let mut buffer = Vec::with_capacity(sequencer.size() as usize);
        buffer.resize_with(sequencer.size() as usize, || None);

        Ok(RingBuffer {
            sequencer,
            buffer,
            read: 0,
            write: 0,
            count: 0,
        })
    }

    pub fn sequencer(&self) -> &Sequencer {
        &self.sequencer
    }

    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    pub fn read(&self) -> u64 {
        self.read
    }

    pub fn write(&self) -> u64 {
        self.write
    }

    /// number of occupied slots, which can differ from the distance between `write` and `read`
    pub fn count(&self) -> usize {
        self.count
    }

    pub fn is_full(&self) -> bool {
        self.sequencer.distance(self.write, self.read) == -1
    }

    pub fn distance_to_read(&self, sequence: u64) -> i64 {
        self.sequencer.distance(sequence, self.read)
    }

    fn slot(&self, sequence: u64) -> usize {
        self.sequencer.move_in_bounds(sequence) as usize
    }

    /// stores the item at `write`, returning the sequence number it is stored under
    pub fn enqueue(&mut self, item: T) -> Result<u64, TransportError> {
        if self.is_full() {
            return Err(TransportError::BufferFull);
        }

        let sequence = self.write;
        let slot = self.slot(sequence);
        self.buffer[slot] = Some(item);
        self.write = self.sequencer.next_after(self.write);
        self.count += 1;
        Ok(sequence)
    }

    pub fn try_get(&self, sequence: u64) -> Option<&T> {
        self.buffer[self.slot(sequence)].as_ref()
    }

    pub fn try_get_mut(&mut self, sequence: u64) -> Option<&mut T> {
        let slot = self.slot(sequence);
        self.buffer[slot].as_mut()
    }

    pub fn exists(&self, sequence: u64) -> bool {
        self.buffer[self.slot(sequence)].is_some()
    }

    pub fn try_peek(&self) -> Option<&T> {
        self.try_get(self.read)
    }

    /// removes the item at `read` and advances `read` by one. Returns `None` without changing
    ///  anything if the slot at `read` is empty.
    pub fn try_dequeue(&mut self) -> Option<T> {
        let slot = self.slot(self.read);
        let item = self.buffer[slot].take()?;
        self.count -= 1;
        self.read = self.sequencer.next_after(self.read);
        Some(item)
    }

    /// Places an item at a specific sequence, e.g. for out-of-order arrival. `write` is moved
    ///  past the inserted item if it was ahead of it.
    pub fn insert_at(&mut self, sequence: u64, item: T) {
        let slot = self.slot(sequence);
        assert!(self.buffer[slot].is_none(), "slot for sequence {} is already occupied", sequence);

        self.buffer[slot] = Some(item);
        self.count += 1;

        if self.sequencer.distance(sequence, self.write) >= 0 {
            self.write = self.sequencer.next_after(sequence);
        }
    }

    pub fn remove_at(&mut self, sequence: u64) -> T {
        let slot = self.slot(sequence);
        let item = self.buffer[slot].take()
            .unwrap_or_else(|| panic!("slot for sequence {} is empty", sequence));

        self.count -= 1;
        item
    }

    /// Moves `read` forward over empty slots, stopping at the first occupied slot or at `write`.
    ///  Nothing is removed.
    pub fn move_read_to_next_non_empty(&mut self) {
        while self.read != self.write && !self.exists(self.read) {
            self.read = self.sequencer.next_after(self.read);
        }
    }

    pub fn move_read_one(&mut self) {
        self.read = self.sequencer.next_after(self.read);
    }

    /// calls `release` for every stored item and resets the buffer to its initial state
    pub fn clear_and_release(&mut self, mut release: impl FnMut(T)) {
        for slot in self.buffer.iter_mut() {
            if let Some(item) = slot.take() {
                release(item);
            }
        }

        self.read = 0;
        self.write = 0;
        self.count = 0;
    }
}
