pub mod vertical;

pub use vertical::{ReseedReason, UpdateOutcome, VerticalFilter, VerticalFilterConfig, VerticalFilterState};
