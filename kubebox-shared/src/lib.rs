//! Types shared between the kubebox core and its consumers.

pub mod constants;
pub mod errors;

pub use errors::{KubeboxError, KubeboxResult};
