pub mod config;
pub mod db;
pub mod error;
pub mod extracts;
pub mod matcher;
pub mod merger;
pub mod resolver;
pub mod scheduler;
pub mod staging;
