pub mod signature;

pub use signature::{sign_payload, verify_payload_signature};
