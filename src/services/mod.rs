//! Services module for business logic

pub mod payment_flow;
