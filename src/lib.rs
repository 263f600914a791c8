pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod executor;
pub mod generator;
pub mod model;
pub mod pipeline;
pub mod progress;
pub mod runs;
pub mod sessions;
