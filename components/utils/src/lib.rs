pub mod env;
pub mod logger;
pub mod readable_size;

/// Default number of index zones: half the cores, at least one and at most
/// [`dedupe_common::MAX_ZONES`].
pub fn default_zone_count() -> usize {
    let cores = num_cpus::get();
    (cores / 2).clamp(1, dedupe_common::MAX_ZONES)
}
