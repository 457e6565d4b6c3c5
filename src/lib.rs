//! FundFlow service: configuration, logging, backend selection and the HTTP
//! adapter around `fundflow-core`.

pub mod config;
pub mod error;
pub mod http;
pub mod logging;
pub mod storage;
