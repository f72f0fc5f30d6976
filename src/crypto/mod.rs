//! HMAC passage tokens: hashing, identifier normalization, time windows.

pub mod freshness;
pub mod hash;
pub mod identifier;
pub mod token;
