//! The `collection/*` provenance block written into every output file.

use crate::container::WritePlan;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Path of the only dataset that differs between otherwise identical runs.
pub const CREATION_DATE: &str = "collection/creation_date";

pub fn collection_path(key: &str) -> String {
    format!("collection/{key}")
}

/// Today's local date as `YYYY-MM-DD`.
pub fn creation_date() -> String {
    chrono::Local::now().format("%Y-%m-%d").to_string()
}

/// Creation date, software version and method name.
pub fn standard(method: &str) -> WritePlan {
    let mut plan = WritePlan::new();
    plan.push(CREATION_DATE, creation_date());
    plan.push(collection_path("version"), VERSION);
    plan.push(collection_path("method"), method);
    plan
}
