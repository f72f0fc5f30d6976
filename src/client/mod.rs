//! HTTP transport to the vendor servers.

pub mod http;
