//! Configuration sources: global file, workspace files, environment.

pub(crate) mod environment;
pub(crate) mod global_file;
pub(crate) mod workspace_file;
