use thiserror::Error;

/// Failures surfaced to callers of the allocator.
///
/// Running out of memory for headers or payloads is not part of this enum at the API
/// boundary: the collector cannot make progress without them, so it retries once after a
/// collection and then goes through [oom_abort].
#[derive(Debug, Error)]
pub enum GcError {
    #[error("out of memory while allocating {0} bytes")]
    OutOfMemory(usize),
    #[error("invalid GC configuration: {0}")]
    InvalidConfig(String),
    #[error("`{operation}` is not supported for {kind} headers")]
    Unsupported {
        operation: &'static str,
        kind: &'static str,
    },
    #[error("GC info table exhausted ({0} types registered)")]
    TypeTableExhausted(usize),
    #[error("cannot merge arenas that were built on a different type table")]
    ForeignTypeTable,
    #[error("operation is not allowed while a collection is in progress")]
    CollectionInProgress,
    #[error("no header pool id left ({0} pools in use)")]
    PoolLimit(usize),
}

/// Abort the process after an irrecoverable allocation failure.
#[cold]
pub fn oom_abort(size: usize) -> ! {
    log::error!("OutOfMemory: failed to allocate {} bytes after a full collection", size);
    eprintln!("OutOfMemory ({} bytes)", size);
    eprintln!("{:?}", backtrace::Backtrace::new());
    std::process::abort();
}
