pub mod error;
pub mod fetch;
pub mod job;
pub mod settings;
pub mod store;
pub mod types;
