//! Vendor wire documents.

pub mod models;
