//! Default values for `RunnerConfig`, centralized so `serde` can fill in
//! fields omitted from the TOML file.

/// Default module namespace the runner looks up the user's `main` in.
pub fn default_module_name() -> String {
    "__main__".to_string()
}

/// Default verbosity (quiet).
pub fn default_verbose() -> bool {
    false
}

/// Default: do not force the spawn/broker path.
pub fn default_spawn_workers() -> bool {
    false
}

/// Default number of ranks per spawned collective worker group.
pub fn default_nprocs_per_worker() -> usize {
    1
}

/// Default: the broker only relays, it does not also execute tasks.
pub fn default_broker_is_worker() -> bool {
    false
}
