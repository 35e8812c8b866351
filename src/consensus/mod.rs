//! Multi-signature consensus: canonical message, threshold collection and
//! peer exchange

pub mod coordinator;
pub mod message;
pub mod transport;

pub use coordinator::{Acceptance, SignatureCoordinator};
pub use transport::{HttpTransport, SignatureBroadcast, SignatureMessage};
