//! sweeptrack core library: bookkeeping for large hyperparameter sweeps run
//! as scheduler job arrays.
//!
//! Results are read from one of three layouts (a flat-text results file,
//! one directory per run, or a SQLite database), reconciled against the
//! parameter registry and the submission log, and every parameter id gets a
//! completion status. Ids without results are diagnosed from their job logs
//! and from scheduler accounting. Complete results can be ranked per
//! result-set or by a composite score across result-sets.

pub mod config;
pub mod diagnostics;
pub mod errors;
pub mod models;
pub mod pipeline;
pub mod query;
pub mod store;
