//! HTTP middleware: error rendering and request logging

pub mod error;
pub mod logging;
