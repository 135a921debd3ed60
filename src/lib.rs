pub mod api;
pub mod cache;
pub mod cli;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod record;
pub mod store;
pub mod upload;
pub mod util;
