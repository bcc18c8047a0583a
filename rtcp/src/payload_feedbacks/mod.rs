//! Payload-specific feedback messages, RFC 4585 section 6.3.

pub mod full_intra_request;
pub mod picture_loss_indication;
