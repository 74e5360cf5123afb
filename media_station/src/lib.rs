pub mod api;
pub mod config;
pub mod error;
pub mod files;
pub mod housekeeping;
pub mod lease;
pub mod service;
pub mod transcode;
