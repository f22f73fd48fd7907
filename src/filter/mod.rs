// Filter module - DUPLICATE SUPPRESSION

mod dedup;

pub use dedup::{DedupFilter, DEFAULT_DEDUP_WINDOW};
