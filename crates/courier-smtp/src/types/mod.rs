//! Core SMTP types.

mod address;
mod extension;
mod message;
mod mime;
mod reply;

pub use address::{Address, AddressError};
pub use extension::{Capabilities, Extension};
pub use message::{EncodingCeiling, Header, Message, MessageError, MessageSource, RemovedHeader};
pub use reply::{Reply, ReplyCode, ReplyLine};
