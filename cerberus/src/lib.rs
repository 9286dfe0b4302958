pub mod analytics;
pub mod buffer_pool;
pub mod config;
pub mod docs;
pub mod inspector;
pub mod metrics;
pub mod numa;
pub mod serializable_types;
pub mod steering;
pub mod storage;
pub mod web_api;
