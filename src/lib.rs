//! Mobile-money payment to voucher reconciliation service.
//!
//! A subscriber pays for a prepaid voucher of a fixed denomination; the
//! gateway reports the outcome through webhooks and status checks, and the
//! reconciliation engine turns every report into at most one terminal
//! transition and at most one voucher.

pub mod api;
pub mod cache;
pub mod config;
pub mod database;
pub mod error;
pub mod health;
pub mod logging;
pub mod middleware;
pub mod payments;
pub mod services;
pub mod workers;
