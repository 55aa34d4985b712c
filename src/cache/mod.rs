pub mod local_cache;

pub use local_cache::{spawn_cleanup, LocalCache, Partition};
