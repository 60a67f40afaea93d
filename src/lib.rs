//! Near-duplicate image finder.
//!
//! Files are hashed perceptually across a pool of workers, stored, then
//! clustered by edit distance between their hashes.

pub mod app;
pub mod batch;
pub mod config;
pub mod db;
pub mod logging;
pub mod output;
pub mod pipeline;
pub mod scanner;
pub mod tasks;
