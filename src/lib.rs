pub mod config;
pub mod device;
pub mod dispatcher;
pub mod export;
pub mod logcat;
pub mod phase;
pub mod report;
