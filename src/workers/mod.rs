pub mod stale_payment_sweeper;
