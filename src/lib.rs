pub mod cache;
pub mod config;
pub mod db;
pub mod dedup;
pub mod error;
pub mod fetch;
pub mod model;
pub mod notify;
pub mod providers;
pub mod sync;
