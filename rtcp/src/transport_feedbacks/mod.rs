//! Transport layer feedback messages, RFC 4585 section 6.2.

pub mod transport_layer_cc;
pub mod transport_layer_nack;
