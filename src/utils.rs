const FALLBACK_LOOP_COUNT: usize = 4;

/// Worker loop count used when the configuration asks for hardware
/// concurrency.
pub fn default_loop_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(FALLBACK_LOOP_COUNT)
}
