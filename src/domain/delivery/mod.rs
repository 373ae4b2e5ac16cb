//! Delivery aggregate - per-record attempt loop state and transitions.

pub mod state;
pub mod transitions;

pub use state::{
    AttemptResult, Delivered, Delivery, DeliveryAttempt, DeliveryOutcome, DeliveryState, Failed,
    FailureReason, Ready,
};
pub use transitions::RetryConfig;
