//! Re-export of the metadata-collection layer used to build `metadata.json`.

pub use kiln_environment::{collect_environment, collect_git_info, DiffPolicy, EnvironmentSnapshot, GitSnapshot};
