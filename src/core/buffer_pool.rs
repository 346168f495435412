/// Scratch read buffers owned by one event loop.
///
/// Buffers go out as the payload of a task and come back once the task is
/// handled, so a steady-state loop stops allocating after warm-up.
pub struct BufferPool {
    free: Vec<Vec<u8>>,
    block_size: usize,
    max_idle: usize,
    allocated_bytes: usize,
}

impl BufferPool {
    pub fn new(block_size: usize, max_idle: usize) -> Self {
        Self {
            free: Vec::new(),
            block_size,
            max_idle,
            allocated_bytes: 0,
        }
    }

    /// A zero-filled buffer of exactly `block_size` bytes.
    pub fn acquire(&mut self) -> Vec<u8> {
        if let Some(buf) = self.free.pop() {
            return buf;
        }
        self.allocated_bytes += self.block_size;
        vec![0u8; self.block_size]
    }

    pub fn release(&mut self, mut buf: Vec<u8>) {
        if self.free.len() >= self.max_idle || buf.capacity() < self.block_size {
            self.allocated_bytes = self.allocated_bytes.saturating_sub(self.block_size);
            return;
        }
        buf.resize(self.block_size, 0);
        self.free.push(buf);
    }

    pub fn idle(&self) -> usize {
        self.free.len()
    }

    pub fn usage_kb(&self) -> usize {
        self.allocated_bytes / 1024
    }
}
