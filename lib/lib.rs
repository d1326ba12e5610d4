pub mod backup;
pub mod build_info;
pub mod cli;
pub mod config;
pub mod db;
pub mod logging;
pub mod processor;
pub mod provider;
pub mod queue;
pub mod service;
