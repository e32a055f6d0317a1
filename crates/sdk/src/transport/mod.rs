//! Transport layer for the shoal SDK.

pub mod http;

pub use http::HttpTransport;
