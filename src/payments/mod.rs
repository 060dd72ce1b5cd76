//! Mobile-money gateway seam: provider trait, wire types and status mapping

pub mod error;
pub mod provider;
pub mod providers;
pub mod status;
pub mod types;
pub mod utils;

pub use error::{PaymentError, PaymentResult};
pub use provider::CollectionProvider;
pub use status::{map_provider_status, map_status, MappedStatus, MobileNetwork};
