//! Settings cache shared across requests and processes.

pub mod format;
pub mod settings;
pub mod store;
