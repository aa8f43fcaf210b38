//! Orchestration of machine lifecycles over the store, certificates and drivers.

pub mod constants;
pub mod layout;
pub mod lock;
pub mod options;

mod core;
mod create;
mod lifecycle;

pub use core::KubeboxClient;
pub use options::{ClientOptions, WaitPolicy};
