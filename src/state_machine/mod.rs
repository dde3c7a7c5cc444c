//! State machines driven by the publishing pipeline.

pub mod lifecycle_sm;
