#![warn(rust_2018_idioms)]
#![allow(dead_code)]

pub use rtcp;
pub use util;

mod compound;
pub mod config;
mod error;
pub mod event;
pub mod mock;
pub mod nack;
pub mod packet_info;
mod scheduler;
pub mod session;
pub mod source;
mod source_table;
pub mod twcc;

pub use config::{FnTimeGen, SessionConfig, SessionConfigBuilder};
pub use error::{flatten_errs, Error, Result};
pub use event::SessionEvent;
pub use nack::{NackFciBuilder, SendingNacks};
pub use packet_info::RtpPacketInfo;
pub use session::{RtcpWriter, Session};
pub use source::SourceStats;
pub use source_table::CollisionAction;
pub use twcc::{TwccPacket, TwccStats};
