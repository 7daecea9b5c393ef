//! The two driving operations: consuming updates and publishing them.

pub mod error;
pub mod publish;
pub mod update;
