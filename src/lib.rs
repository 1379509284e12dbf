pub mod api;
pub mod config;
pub mod error;
pub mod http;
pub mod ident;
pub mod meta;
pub mod obs;
pub mod predict;
pub mod service;
pub mod storage;

#[cfg(any(test, feature = "test-util"))]
pub mod test_support;
