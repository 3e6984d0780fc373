/// Snapshot of the collector state returned by [Arenas::statistics](crate::arenas::Arenas::statistics).
#[derive(Clone, Debug, Default, PartialEq)]
pub struct HeapStatistics {
    pub header_memory: usize,
    pub memory_pool_size: usize,
    pub constant_memory_pool_size: usize,
    pub fixed_size_memory: usize,
    pub active_pmcs: usize,
    pub total_pmcs: usize,
    pub active_buffers: usize,
    pub total_buffers: usize,
    pub mark_runs: usize,
    pub lazy_mark_runs: usize,
    pub collect_runs: usize,
    pub header_allocs_since_collect: usize,
    pub mem_allocs_since_collect: usize,
    pub total_copied: usize,
    pub impatient_pmcs: usize,
    pub extended_pmcs: usize,
    pub header_threshold: usize,
}

impl HeapStatistics {
    pub fn total_memory_allocated(&self) -> usize {
        self.header_memory
            + self.memory_pool_size
            + self.constant_memory_pool_size
            + self.fixed_size_memory
    }
}

/// Selector for [Arenas::info](crate::arenas::Arenas::info).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum InfoKind {
    TotalMemAlloc,
    GcMarkRuns,
    GcCollectRuns,
    ActivePmcs,
    ActiveBuffers,
    TotalPmcs,
    TotalBuffers,
    HeaderAllocsSinceCollect,
    MemAllocsSinceCollect,
    TotalCopied,
    ImpatientPmcs,
    GcLazyMarkRuns,
    ExtendedPmcs,
}

impl HeapStatistics {
    pub fn get(&self, kind: InfoKind) -> usize {
        match kind {
            InfoKind::TotalMemAlloc => self.total_memory_allocated(),
            InfoKind::GcMarkRuns => self.mark_runs,
            InfoKind::GcCollectRuns => self.collect_runs,
            InfoKind::ActivePmcs => self.active_pmcs,
            InfoKind::ActiveBuffers => self.active_buffers,
            InfoKind::TotalPmcs => self.total_pmcs,
            InfoKind::TotalBuffers => self.total_buffers,
            InfoKind::HeaderAllocsSinceCollect => self.header_allocs_since_collect,
            InfoKind::MemAllocsSinceCollect => self.mem_allocs_since_collect,
            InfoKind::TotalCopied => self.total_copied,
            InfoKind::ImpatientPmcs => self.impatient_pmcs,
            InfoKind::GcLazyMarkRuns => self.lazy_mark_runs,
            InfoKind::ExtendedPmcs => self.extended_pmcs,
        }
    }
}

pub(crate) struct FormattedSize {
    pub size: usize,
}

impl std::fmt::Display for FormattedSize {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let ksize = (self.size as f64) / 1024f64;

        if ksize < 1f64 {
            return write!(f, "{}B", self.size);
        }

        let msize = ksize / 1024f64;

        if msize < 1f64 {
            return write!(f, "{:.1}K", ksize);
        }

        let gsize = msize / 1024f64;

        if gsize < 1f64 {
            write!(f, "{:.1}M", msize)
        } else {
            write!(f, "{:.1}G", gsize)
        }
    }
}

pub(crate) fn formatted_size(size: usize) -> FormattedSize {
    FormattedSize { size }
}

impl std::fmt::Display for HeapStatistics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Heap statistics:")?;
        writeln!(
            f,
            "  Memory allocated for headers: {}",
            formatted_size(self.header_memory)
        )?;
        writeln!(
            f,
            "  Memory pool: {} (constant pool {})",
            formatted_size(self.memory_pool_size),
            formatted_size(self.constant_memory_pool_size)
        )?;
        writeln!(
            f,
            "  Fixed size storage: {}",
            formatted_size(self.fixed_size_memory)
        )?;
        writeln!(
            f,
            "  Total memory allocated: {}",
            formatted_size(self.total_memory_allocated())
        )?;
        writeln!(
            f,
            "  PMCs: {} active of {} ({} impatient, {} with attributes)",
            self.active_pmcs, self.total_pmcs, self.impatient_pmcs, self.extended_pmcs
        )?;
        writeln!(
            f,
            "  Buffers: {} active of {}",
            self.active_buffers, self.total_buffers
        )?;
        writeln!(
            f,
            "  GC runs: {} mark, {} lazy mark, {} collect",
            self.mark_runs, self.lazy_mark_runs, self.collect_runs
        )?;
        writeln!(
            f,
            "  Since last collection: {} headers, {}",
            self.header_allocs_since_collect,
            formatted_size(self.mem_allocs_since_collect)
        )?;
        writeln!(f, "  Copied by compaction: {}", formatted_size(self.total_copied))?;
        writeln!(f, "  Header threshold: {}", self.header_threshold)?;
        Ok(())
    }
}
