pub mod app_service;
pub mod notifier;
pub mod registry;
pub mod scheduler;
