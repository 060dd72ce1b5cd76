//! Services module for business logic and integrations

pub mod denominations;
pub mod notification;
pub mod payment_initiation;
pub mod payment_status;
pub mod phone;
pub mod reconciliation;

pub use denominations::DenominationSet;
pub use payment_initiation::{InitiatedPayment, InitiationError, PaymentInitiationService};
pub use payment_status::{PaymentStatusService, PaymentStatusView, StatusConfig};
pub use reconciliation::{
    ReconciliationEngine, ReconciliationError, ReconciliationOutcome, ReconciliationRequest,
};
