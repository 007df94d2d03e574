//! Utility functions shared across modules.

pub mod permissions;

pub use permissions::restrict_file_permissions;
