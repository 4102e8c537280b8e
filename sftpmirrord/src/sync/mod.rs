pub mod cache;
pub mod local_watcher;
pub mod paths;
pub mod queue;
pub mod worker;
