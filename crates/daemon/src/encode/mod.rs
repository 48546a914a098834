//! External encoder invocations

pub mod derived;
pub mod ffmpeg;

pub use derived::{generate_derived, DerivedArtifacts, DerivedSettings};
pub use ffmpeg::{build_merge_command, run_merge, EncodeError, FfmpegMergeParams};
