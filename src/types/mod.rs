//! Core data model shared across the pipeline, storage, and API layers.

mod owner;
mod packet;
mod session;
mod contact;

pub use owner::OwnerId;
pub use packet::*;
pub use session::Session;
pub use contact::{ContactRequest, ContactSubmission};
