// Library root: exposes every module for the binary and for integration
// tests in `tests/`. Production entry point is `src/main.rs`.

pub mod api;
pub mod cache;
pub mod cli;
pub mod config;
pub mod db;
pub mod device;
pub mod error;
pub mod estimate;
pub mod logging;
pub mod mail;
pub mod metrics;
pub mod models;
pub mod poller;
pub mod pool;
pub mod report;
pub mod repository;
pub mod scheduler;
pub mod search;
pub mod services;
