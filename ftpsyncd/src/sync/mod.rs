pub mod backoff;
pub mod conflict;
pub mod cycle_lock;
pub mod engine;
pub mod local_watcher;
pub mod paths;
pub mod pool;
pub mod runtime;
pub mod stats;
pub mod target;
pub mod transport;
