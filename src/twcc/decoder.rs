use std::collections::VecDeque;
use std::time::Duration;

use rtcp::transport_feedbacks::transport_layer_cc::TransportLayerCc;

use crate::error::{Error, Result};

const REFERENCE_TIME_UNIT_US: i64 = 64000;
const REFERENCE_TIME_WRAP: i64 = 1 << 24;
const REFERENCE_TIME_MASK: i64 = REFERENCE_TIME_WRAP - 1;
/// Accepted feedbacks kept to detect stale ones.
const RECENT_FEEDBACKS: usize = 16;

/// Status of one packet as reported by the remote side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct TwccPacketStatus {
    pub(crate) seqnum: u16,
    pub(crate) lost: bool,
    pub(crate) remote_ts: Option<Duration>,
}

#[derive(Debug, Copy, Clone)]
struct Accepted {
    fb_pkt_count: u8,
    base_sequence_number: u16,
    packet_status_count: u16,
}

impl Accepted {
    /// Whether this feedback already described every packet of `other`.
    fn covers(&self, other: &TransportLayerCc) -> bool {
        let offset = other.base_sequence_number.wrapping_sub(self.base_sequence_number) as u32;
        offset < self.packet_status_count as u32
            && offset + other.packet_status_count as u32 <= self.packet_status_count as u32
    }

    fn is_newer_than(&self, fb_pkt_count: u8) -> bool {
        (1..=128).contains(&self.fb_pkt_count.wrapping_sub(fb_pkt_count))
    }

    /// Whether `other` is this very feedback, received again.
    fn is_repeated_by(&self, other: &TransportLayerCc) -> bool {
        self.fb_pkt_count == other.fb_pkt_count
            && self.base_sequence_number == other.base_sequence_number
            && self.packet_status_count == other.packet_status_count
    }
}

/// TwccDecoder turns transport-wide feedback back into per-packet arrival times.
#[derive(Debug, Default)]
pub(crate) struct TwccDecoder {
    last_reference_time: i64,
    extended_reference_time: i64,
    last_fb_pkt_count: Option<u8>,
    recent: VecDeque<Accepted>,
    /// Feedbacks accepted although their count went backwards.
    pub(crate) out_of_order: u64,
}

impl TwccDecoder {
    pub(crate) fn new() -> Self {
        TwccDecoder {
            extended_reference_time: REFERENCE_TIME_WRAP,
            ..Default::default()
        }
    }

    /// Advances the extended reference time by the signed 24-bit step from the
    /// previous value.
    fn unwrap_reference_time(&mut self, reference_time: u32) -> i64 {
        let reference_time = reference_time as i64 & REFERENCE_TIME_MASK;
        let mut diff = (reference_time - self.last_reference_time) & REFERENCE_TIME_MASK;
        if diff > REFERENCE_TIME_MASK >> 1 {
            diff -= REFERENCE_TIME_WRAP;
        }
        self.extended_reference_time += diff;
        self.last_reference_time = reference_time;
        self.extended_reference_time
    }

    /// decode returns the status of every packet `fb` describes, in sequence
    /// order. Stale and malformed feedback yields an error and leaves the
    /// decoder untouched.
    pub(crate) fn decode(&mut self, fb: &TransportLayerCc) -> Result<Vec<TwccPacketStatus>> {
        if self
            .recent
            .iter()
            .any(|r| {
                r.is_repeated_by(fb) || (r.is_newer_than(fb.fb_pkt_count) && r.covers(fb))
            })
        {
            log::debug!(
                "stale twcc feedback {} for seq {}+{}",
                fb.fb_pkt_count,
                fb.base_sequence_number,
                fb.packet_status_count
            );
            return Err(Error::StaleFeedback);
        }

        let symbols = fb.symbols();
        if symbols.len() < fb.packet_status_count as usize {
            return Err(Error::MalformedPacket(format!(
                "twcc feedback has {} of {} statuses",
                symbols.len(),
                fb.packet_status_count
            )));
        }
        let with_delta = symbols.iter().filter(|s| s.delta_size() > 0).count();
        if fb.recv_deltas.len() < with_delta {
            return Err(Error::MalformedPacket(format!(
                "twcc feedback has {} of {} deltas",
                fb.recv_deltas.len(),
                with_delta
            )));
        }

        if let Some(last) = self.last_fb_pkt_count {
            if fb.fb_pkt_count.wrapping_sub(last) > 128 {
                self.out_of_order += 1;
                log::debug!(
                    "twcc feedback count went back from {last} to {}",
                    fb.fb_pkt_count
                );
            }
        }
        self.last_fb_pkt_count = Some(fb.fb_pkt_count);

        let base_us = self.unwrap_reference_time(fb.reference_time) * REFERENCE_TIME_UNIT_US;
        let mut deltas = fb.recv_deltas.iter();
        let mut arrival_us = base_us;
        let mut out = Vec::with_capacity(symbols.len());
        for (i, symbol) in symbols.iter().enumerate() {
            let seqnum = fb.base_sequence_number.wrapping_add(i as u16);
            if !symbol.is_received() {
                out.push(TwccPacketStatus {
                    seqnum,
                    lost: true,
                    remote_ts: None,
                });
                continue;
            }
            // received without a delta: no arrival time
            let remote_ts = if symbol.delta_size() > 0 {
                if let Some(d) = deltas.next() {
                    arrival_us += d.delta;
                }
                Some(Duration::from_micros(arrival_us.max(0) as u64))
            } else {
                None
            };
            out.push(TwccPacketStatus {
                seqnum,
                lost: false,
                remote_ts,
            });
        }

        self.recent.push_back(Accepted {
            fb_pkt_count: fb.fb_pkt_count,
            base_sequence_number: fb.base_sequence_number,
            packet_status_count: fb.packet_status_count,
        });
        while self.recent.len() > RECENT_FEEDBACKS {
            self.recent.pop_front();
        }

        Ok(out)
    }
}
