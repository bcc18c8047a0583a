
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use rtcp::raw_packet::RawPacket;
use rtcp::transport_feedbacks::transport_layer_nack::{
    nack_pairs_from_sequence_numbers, NackPair, TransportLayerNack, NACK_HEADER_LENGTH,
    NACK_PAIR_LENGTH,
};

use crate::compound::CompoundBuilder;
use crate::error::{Error, Result};

/// Feedback an application built itself in place of generic NACKs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendingNacks {
    /// One complete RTCP packet, APP for instance.
    pub payload: Bytes,
    /// How many of the leading sequence numbers the payload covers.
    pub consumed: usize,
}

/// NackFciBuilder lets an application replace the generic NACK packing.
///
/// It is called with the due sequence numbers of one media source in wrapping
/// order. Returning `None` keeps the default packing for all of them.
pub trait NackFciBuilder: Send + Sync {
    fn build_fci(&self, media_ssrc: u32, seqnums: &[u16]) -> Option<SendingNacks>;
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) struct NackEntry {
    pub(crate) seqnum: u16,
    pub(crate) requested_at: Duration,
    pub(crate) deadline: Option<Duration>,
}

/// Sorts sequence numbers in 16-bit wrapping order: ascending, starting right
/// after the widest hole of the circle.
pub(crate) fn sort_wrapping(seqnums: &mut Vec<u16>) {
    seqnums.sort_unstable();
    seqnums.dedup();
    if seqnums.len() < 2 {
        return;
    }

    let n = seqnums.len();
    let mut start = 0;
    let mut widest = seqnums[0] as u32 + (1 << 16) - seqnums[n - 1] as u32;
    for i in 1..n {
        let gap = (seqnums[i] - seqnums[i - 1]) as u32;
        if gap > widest {
            widest = gap;
            start = i;
        }
    }
    seqnums.rotate_left(start);
}

/// NackAggregator collects retransmission requests until an RTCP packet has room
/// for them.
#[derive(Default)]
pub(crate) struct NackAggregator {
    pending: BTreeMap<u32, Vec<NackEntry>>,
    fci_builder: Option<Arc<dyn NackFciBuilder>>,
}

impl NackAggregator {
    pub(crate) fn set_fci_builder(&mut self, builder: Option<Arc<dyn NackFciBuilder>>) {
        self.fci_builder = builder;
    }

    /// request queues `seqnum` of `media_ssrc`, to be sent `delay` after `now`.
    /// A pending request for the same packet only takes the new deadline.
    pub(crate) fn request(
        &mut self,
        media_ssrc: u32,
        seqnum: u16,
        now: Duration,
        delay: Duration,
        deadline: Option<Duration>,
    ) {
        let entries = self.pending.entry(media_ssrc).or_default();
        if let Some(entry) = entries.iter_mut().find(|e| e.seqnum == seqnum) {
            entry.deadline = deadline;
            return;
        }
        entries.push(NackEntry {
            seqnum,
            requested_at: now + delay,
            deadline,
        });
    }

    /// Number of pending sequence numbers over all sources.
    pub(crate) fn len(&self) -> usize {
        self.pending.values().map(|v| v.len()).sum()
    }

    pub(crate) fn forget(&mut self, media_ssrc: u32) {
        if let Some(entries) = self.pending.remove(&media_ssrc) {
            log::debug!(
                "dropping {} nacks for vanished ssrc {media_ssrc:08x}",
                entries.len()
            );
        }
    }

    /// Due sequence numbers of `media_ssrc` in wrapping order.
    pub(crate) fn due(&self, media_ssrc: u32, now: Duration) -> Vec<u16> {
        let mut seqnums: Vec<u16> = self
            .pending
            .get(&media_ssrc)
            .map(|entries| {
                entries
                    .iter()
                    .filter(|e| e.requested_at <= now)
                    .map(|e| e.seqnum)
                    .collect()
            })
            .unwrap_or_default();
        sort_wrapping(&mut seqnums);
        seqnums
    }

    fn consume(&mut self, media_ssrc: u32, seqnums: &[u16], now: Duration) {
        if let Some(entries) = self.pending.get_mut(&media_ssrc) {
            entries.retain(|e| {
                if !seqnums.contains(&e.seqnum) {
                    return true;
                }
                if let Some(deadline) = e.deadline {
                    if deadline < now {
                        log::debug!(
                            "nack {} for {media_ssrc:08x} sent {:?} late",
                            e.seqnum,
                            now - deadline
                        );
                    }
                }
                false
            });
            if entries.is_empty() {
                self.pending.remove(&media_ssrc);
            }
        }
    }

    /// drain packs due entries of `media_ssrc` into as many NACK entries as fit in
    /// `budget_bytes`, oldest sequence numbers first, and forgets what it packed.
    pub(crate) fn drain(
        &mut self,
        media_ssrc: u32,
        budget_bytes: usize,
        now: Duration,
    ) -> Vec<NackPair> {
        if budget_bytes < NACK_HEADER_LENGTH + NACK_PAIR_LENGTH {
            return vec![];
        }
        let max_pairs = (budget_bytes - NACK_HEADER_LENGTH) / NACK_PAIR_LENGTH;

        let due = self.due(media_ssrc, now);
        let mut pairs = nack_pairs_from_sequence_numbers(&due);
        pairs.truncate(max_pairs);

        let packed: Vec<u16> = pairs.iter().flat_map(|p| p.packet_list()).collect();
        self.consume(media_ssrc, &packed, now);
        pairs
    }

    /// Writes the due requests of every known media source into `out`. What does
    /// not fit stays queued and is reported as `CapacityExceeded`.
    pub(crate) fn write_feedback(
        &mut self,
        sender_ssrc: u32,
        out: &mut CompoundBuilder,
        now: Duration,
        known: impl Fn(u32) -> bool,
    ) -> Result<()> {
        let ssrcs: Vec<u32> = self.pending.keys().copied().collect();
        for media_ssrc in ssrcs {
            if !known(media_ssrc) {
                self.forget(media_ssrc);
                continue;
            }

            if let Some(builder) = self.fci_builder.clone() {
                let due = self.due(media_ssrc, now);
                if !due.is_empty() {
                    if let Some(sending) = builder.build_fci(media_ssrc, &due) {
                        let consumed = sending.consumed.min(due.len());
                        if out.try_push(Box::new(RawPacket(sending.payload))) {
                            self.consume(media_ssrc, &due[..consumed], now);
                        }
                    }
                }
            }

            let nacks = self.drain(media_ssrc, out.remaining(), now);
            if nacks.is_empty() {
                continue;
            }
            let pushed = out.try_push(Box::new(TransportLayerNack {
                sender_ssrc,
                media_ssrc,
                nacks,
            }));
            // drain sized the packet to the room left
            debug_assert!(pushed);
        }

        let left: usize = self
            .pending
            .values()
            .flatten()
            .filter(|e| e.requested_at <= now)
            .count();
        if left > 0 {
            Err(Error::CapacityExceeded(left))
        } else {
            Ok(())
        }
    }
}
