//! Test helpers for the tether transport.
//!
//! - [`loss`]: deterministic and random datagram loss
//! - [`chaos`]: duplication, reordering and corruption of datagrams
//! - [`verify`]: self-describing payloads and delivery-order checks

pub mod chaos;
pub mod loss;
pub mod verify;

pub use chaos::{LinkAction, LinkChaos};
pub use loss::{DropDecision, LossGenerator, LossPattern};
pub use verify::{make_message, parse_message, DeliveryLog, DeliveryReport};
