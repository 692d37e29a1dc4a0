//! API surface

pub mod http;
