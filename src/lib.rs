pub mod cli;
pub mod config;
pub mod exporter;
pub mod jira;
pub mod metrics;
pub mod scheduler;
