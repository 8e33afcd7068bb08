//! Failure diagnosis: log scraping and scheduler accounting.

pub mod classifier;
pub mod scheduler;
