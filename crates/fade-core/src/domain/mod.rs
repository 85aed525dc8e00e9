//! Domain model (message ids, expiry metadata, errors).

pub mod errors;
pub mod ids;
pub mod message;

pub use self::errors::StoreError;
pub use self::ids::MessageId;
pub use self::message::{MessageKind, MessageRecord, TimestampMs};
