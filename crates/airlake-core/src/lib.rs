pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod features;
pub mod merge;
pub mod normalize;
pub mod parquet;
pub mod schema;
pub mod store;
pub mod units;
