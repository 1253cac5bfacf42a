pub mod fetch;
pub mod metrics;
pub mod storage;
