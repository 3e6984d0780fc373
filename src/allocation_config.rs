use crate::Config;

/// Allocation counters that decide when allocation should request a collection.
pub struct AllocationConfig {
    pub header_threshold: usize,
    pub memory_threshold: usize,
    pub header_allocations: usize,
    pub memory_allocations: usize,
    /// Headers allocated over the lifetime of the arenas.
    pub total_header_allocations: usize,
}

impl AllocationConfig {
    pub fn new(config: &Config) -> Self {
        Self {
            header_threshold: config.header_collect_threshold,
            memory_threshold: config.memory_collect_threshold,
            header_allocations: 0,
            memory_allocations: 0,
            total_header_allocations: 0,
        }
    }

    pub fn increment_allocations(&mut self) {
        self.header_allocations += 1;
        self.total_header_allocations += 1;
    }

    pub fn increment_memory_allocations(&mut self, size: usize) {
        self.memory_allocations += size;
    }

    pub fn allocation_threshold_exceeded(&self) -> bool {
        self.header_allocations >= self.header_threshold
            || self.memory_allocations >= self.memory_threshold
    }

    /// Resets the counters after a full sweep. When most of the headers survived, the
    /// threshold grows so the next collection is not requested right away.
    pub fn update_after_collection(&mut self, config: &Config, live_headers: usize) {
        self.header_allocations = 0;
        self.memory_allocations = 0;
        let wanted = (live_headers as f64 * config.collect_threshold_growth).ceil() as usize;
        self.header_threshold = wanted.max(config.header_collect_threshold);
    }
}
