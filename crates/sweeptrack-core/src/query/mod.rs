pub mod rank;
pub mod reconcile;
pub mod report;
