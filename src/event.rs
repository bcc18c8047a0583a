use bytes::Bytes;

use crate::twcc::{TwccPacket, TwccStats};

/// Notifications the session raises towards the application.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Another participant uses our SSRC. We moved to `new_ssrc`.
    SsrcCollision { ssrc: u32, new_ssrc: u32 },
    /// A PLI or FIR asked our source `ssrc` for a key unit.
    ForceKeyUnit {
        ssrc: u32,
        sender_ssrc: u32,
        fir: bool,
    },
    /// A generic NACK asked for a retransmission of `seqnum` on `ssrc`.
    RetransmissionRequest {
        ssrc: u32,
        sender_ssrc: u32,
        seqnum: u16,
    },
    TwccPackets(Vec<TwccPacket>),
    TwccStats(TwccStats),
    AppPacket {
        subtype: u8,
        ssrc: u32,
        name: String,
        data: Bytes,
    },
    /// A remote source finished probation.
    NewSource(u32),
    SourceBye { ssrc: u32, reason: Bytes },
    SourceTimeout(u32),
}
