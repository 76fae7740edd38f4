pub mod client;
pub mod error;
pub mod http;
pub mod types;

pub use client::{DarajaClient, DarajaConfig, DarajaEnvironment, StkGateway};
pub use error::{MpesaError, MpesaResult};
pub use types::{
    CallbackAck, CallbackEnvelope, CallbackReceipt, StkCallback, StkPushOutcome, StkPushRequest,
    StkQueryOutcome,
};
