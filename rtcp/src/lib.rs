#![warn(rust_2018_idioms)]
#![allow(dead_code)]

//! RTCP wire codec used by the rtpsession feedback core.
//!
//! Every packet type implements the webrtc-util `Marshal`/`Unmarshal` traits and the
//! object-safe [`packet::Packet`] trait, so a compound datagram can be carried as
//! `Vec<Box<dyn Packet + Send + Sync>>`.

pub mod application_defined;
pub mod compound_packet;
mod error;
pub mod goodbye;
pub mod header;
pub mod packet;
pub mod payload_feedbacks;
pub mod raw_packet;
pub mod receiver_report;
pub mod reception_report;
pub mod sender_report;
pub mod source_description;
pub mod transport_feedbacks;
pub mod util;

pub use error::Error;
