//! Merge rules for configuration layers.

pub(crate) mod merge_policy;
