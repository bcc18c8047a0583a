
mod decoder;
mod encoder;
mod stats;

use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

pub(crate) use decoder::{TwccDecoder, TwccPacketStatus};
pub(crate) use encoder::TwccEncoder;
pub use stats::TwccStats;

/// How many sent packets the send log remembers.
const SEND_LOG_SIZE: usize = 8192;

/// One packet of a decoded transport-wide feedback, joined with what we know
/// about sending it.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TwccPacket {
    pub seqnum: u16,
    /// When we sent it, if it is still in the send log.
    pub local_ts: Option<Duration>,
    /// Arrival time on the remote clock, None when lost.
    pub remote_ts: Option<Duration>,
    pub size: usize,
    pub payload_type: u8,
    pub lost: bool,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
struct SentRecord {
    departure: Duration,
    size: usize,
    payload_type: u8,
}

/// TwccSendLog remembers departure time, size and payload type of the packets
/// we sent with a transport-wide sequence number.
#[derive(Debug, Default)]
pub(crate) struct TwccSendLog {
    records: BTreeMap<u16, SentRecord>,
    order: VecDeque<u16>,
}

impl TwccSendLog {
    pub(crate) fn record(
        &mut self,
        seqnum: u16,
        departure: Duration,
        size: usize,
        payload_type: u8,
    ) {
        let rec = SentRecord {
            departure,
            size,
            payload_type,
        };
        if self.records.insert(seqnum, rec).is_none() {
            self.order.push_back(seqnum);
        }
        while self.order.len() > SEND_LOG_SIZE {
            if let Some(old) = self.order.pop_front() {
                self.records.remove(&old);
            }
        }
    }

    /// Joins decoded statuses with the send log.
    pub(crate) fn join(&self, statuses: &[TwccPacketStatus]) -> Vec<TwccPacket> {
        statuses
            .iter()
            .map(|status| {
                let sent = self.records.get(&status.seqnum);
                TwccPacket {
                    seqnum: status.seqnum,
                    local_ts: sent.map(|s| s.departure),
                    remote_ts: status.remote_ts,
                    size: sent.map_or(0, |s| s.size),
                    payload_type: sent.map_or(0, |s| s.payload_type),
                    lost: status.lost,
                }
            })
            .collect()
    }
}
