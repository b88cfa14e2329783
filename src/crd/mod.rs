//! Custom Resource Definitions for addon-manager
//!
//! This module defines the `Addon` CRD and the types its spec and status use.

mod addon;
pub mod types;


pub use addon::*;
pub use types::*;
