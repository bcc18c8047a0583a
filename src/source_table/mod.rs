
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use rtcp::reception_report::ReceptionReport;

use crate::error::{Error, Result};
use crate::event::SessionEvent;
use crate::packet_info::RtpPacketInfo;
use crate::source::{ConflictingAddresses, Source};

/// Most report blocks a single SR/RR can carry.
pub(crate) const MAX_REPORT_BLOCKS: usize = rtcp::header::COUNT_MAX;

pub(crate) const COLLISION_REASON: &[u8] = b"SSRC Collision";
const TIMEOUT_REASON: &[u8] = b"Source timed out";

/// What to do with a packet that names an SSRC.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CollisionAction {
    /// No collision, process the packet.
    Ignore,
    /// Our sending SSRC collided and was replaced by the new one. The packet is
    /// dropped.
    Rename(u32),
    /// Drop the packet without telling anyone.
    Drop,
}

/// SourceTable keeps every SSRC of the session and decides who owns it.
pub(crate) struct SourceTable {
    sources: BTreeMap<u32, Source>,
    internal_ssrc: u32,
    /// Addresses our own traffic came back from.
    conflicting: ConflictingAddresses,
    probation: u32,
    favor_new: bool,
    rb_generation: u64,
}

impl SourceTable {
    pub(crate) fn new(internal_ssrc: u32, probation: u32, favor_new: bool, now: Duration) -> Self {
        let mut sources = BTreeMap::new();
        sources.insert(internal_ssrc, Source::new_internal(internal_ssrc, now));
        SourceTable {
            sources,
            internal_ssrc,
            conflicting: ConflictingAddresses::default(),
            probation,
            favor_new,
            rb_generation: 0,
        }
    }

    pub(crate) fn internal_ssrc(&self) -> u32 {
        self.internal_ssrc
    }

    pub(crate) fn get(&self, ssrc: u32) -> Option<&Source> {
        self.sources.get(&ssrc)
    }

    pub(crate) fn get_mut(&mut self, ssrc: u32) -> Option<&mut Source> {
        self.sources.get_mut(&ssrc)
    }

    pub(crate) fn is_internal(&self, ssrc: u32) -> bool {
        self.sources.get(&ssrc).map_or(false, |s| s.internal)
    }

    /// Number of participants, ourselves included.
    pub(crate) fn members(&self) -> usize {
        self.sources.values().filter(|s| s.is_active()).count()
    }

    pub(crate) fn senders(&self) -> usize {
        self.sources
            .values()
            .filter(|s| s.is_active() && s.is_sender && (s.internal || s.validated))
            .count()
    }

    pub(crate) fn we_sent(&self) -> bool {
        self.sources
            .get(&self.internal_ssrc)
            .map_or(false, |s| s.is_sender)
    }

    /// Internal sources that still need RTCP, the current one first.
    pub(crate) fn reporting_internal(&self) -> Vec<u32> {
        let mut out = vec![];
        if let Some(s) = self.sources.get(&self.internal_ssrc) {
            if !s.sent_bye {
                out.push(self.internal_ssrc);
            }
        }
        out.extend(
            self.sources
                .values()
                .filter(|s| s.internal && s.ssrc != self.internal_ssrc && !s.sent_bye)
                .map(|s| s.ssrc),
        );
        out
    }

    /// Remote sources we were asked to stop using, waiting for their BYE.
    pub(crate) fn pending_remote_byes(&self) -> Vec<(u32, Option<Bytes>)> {
        self.sources
            .values()
            .filter(|s| !s.internal && s.marked_bye && !s.sent_bye)
            .map(|s| (s.ssrc, s.bye_reason.clone()))
            .collect()
    }

    /// on_receive registers traffic for `ssrc` and resolves a collision when the
    /// address does not match what we know.
    pub(crate) fn on_receive(
        &mut self,
        ssrc: u32,
        address: Option<SocketAddr>,
        is_rtcp: bool,
        now: Duration,
    ) -> CollisionAction {
        if !self.sources.contains_key(&ssrc) {
            let mut source = Source::new(ssrc, self.probation, now);
            if let Some(addr) = address {
                source.set_address(addr, is_rtcp);
            }
            log::debug!("new source {ssrc:08x} from {address:?}");
            self.sources.insert(ssrc, source);
            return CollisionAction::Ignore;
        }

        let action = self.resolve_collision(ssrc, address, is_rtcp, now);
        if action == CollisionAction::Ignore {
            if let Some(source) = self.sources.get_mut(&ssrc) {
                source.last_activity = now;
            }
        }
        action
    }

    /// resolve_collision decides about a packet naming a known `ssrc` that
    /// arrived from `address`.
    pub(crate) fn resolve_collision(
        &mut self,
        ssrc: u32,
        address: Option<SocketAddr>,
        is_rtcp: bool,
        now: Duration,
    ) -> CollisionAction {
        let favor_new = self.favor_new;
        let source = match self.sources.get_mut(&ssrc) {
            Some(source) => source,
            None => return CollisionAction::Ignore,
        };

        let addr = match address {
            Some(addr) => addr,
            None if source.internal => {
                log::debug!("dropping packet on internal ssrc {ssrc:08x} without address");
                return CollisionAction::Drop;
            }
            None => return CollisionAction::Ignore,
        };

        if source.internal {
            if self.conflicting.seen(&addr, now) {
                log::trace!("dropping looped back packet for {ssrc:08x} from {addr}");
                return CollisionAction::Drop;
            }
            self.conflicting.add(addr, now);

            if ssrc != self.internal_ssrc {
                log::debug!("stale internal ssrc {ssrc:08x} seen from {addr}");
                return CollisionAction::Drop;
            }

            let new_ssrc = self.rename_internal(now);
            log::warn!("ssrc {ssrc:08x} collides with {addr}, switching to {new_ssrc:08x}");
            return CollisionAction::Rename(new_ssrc);
        }

        match source.known_address(is_rtcp) {
            None => {
                source.set_address(addr, is_rtcp);
                CollisionAction::Ignore
            }
            Some(known) if known == addr => CollisionAction::Ignore,
            Some(known) => {
                if source.conflicting.seen(&addr, now) {
                    log::trace!("dropping packet for {ssrc:08x} from old address {addr}");
                    return CollisionAction::Drop;
                }
                if favor_new {
                    log::debug!("ssrc {ssrc:08x} moved from {known} to {addr}");
                    source.conflicting.add(known, now);
                    source.set_address(addr, is_rtcp);
                    CollisionAction::Ignore
                } else {
                    log::debug!(
                        "third party collision on {ssrc:08x}: {known} and {addr}"
                    );
                    CollisionAction::Drop
                }
            }
        }
    }

    /// Replaces the current internal source by a fresh one. The old one says BYE.
    fn rename_internal(&mut self, now: Duration) -> u32 {
        let old = self.internal_ssrc;
        if let Some(source) = self.sources.get_mut(&old) {
            source.marked_bye = true;
            source.bye_reason = Some(Bytes::from_static(COLLISION_REASON));
        }

        let new_ssrc = self.random_unused_ssrc();
        self.sources
            .insert(new_ssrc, Source::new_internal(new_ssrc, now));
        self.internal_ssrc = new_ssrc;
        new_ssrc
    }

    fn random_unused_ssrc(&self) -> u32 {
        loop {
            let ssrc = rand::random::<u32>();
            if !self.sources.contains_key(&ssrc) {
                return ssrc;
            }
        }
    }

    /// on_send accounts an outgoing RTP packet. Sending on an SSRC another
    /// participant owns fails until that participant is gone.
    pub(crate) fn on_send(&mut self, pkt: &RtpPacketInfo, now: Duration) -> Result<()> {
        let source = self
            .sources
            .entry(pkt.ssrc)
            .or_insert_with(|| Source::new_internal(pkt.ssrc, now));

        if !source.internal {
            if !source.marked_bye {
                log::warn!(
                    "refusing to send on ssrc {:08x}, it belongs to {:?}",
                    pkt.ssrc,
                    source.address()
                );
                source.marked_bye = true;
                source.bye_reason = Some(Bytes::from_static(COLLISION_REASON));
            }
            return Err(Error::CollisionDetected(pkt.ssrc));
        }

        source.record_sent(pkt.timestamp, pkt.clock_rate, pkt.payload_size, now);
        Ok(())
    }

    /// on_bye handles a BYE naming `ssrc`. BYEs for our own sources are ignored.
    pub(crate) fn on_bye(
        &mut self,
        ssrc: u32,
        reason: &Bytes,
        address: Option<SocketAddr>,
        now: Duration,
    ) -> Option<SessionEvent> {
        if self.is_internal(ssrc) {
            if address.map_or(true, |addr| !self.conflicting.contains(&addr)) {
                log::warn!("ignoring suspicious BYE for our ssrc {ssrc:08x} from {address:?}");
            }
            return None;
        }

        if !self.sources.contains_key(&ssrc) {
            log::debug!("ignoring BYE for unknown ssrc {ssrc:08x}");
            return None;
        }
        if self.on_receive(ssrc, address, true, now) != CollisionAction::Ignore {
            return None;
        }
        let source = self.sources.get_mut(&ssrc)?;
        if source.received_bye {
            return None;
        }
        source.received_bye = true;
        source.bye_reason = Some(reason.clone());
        log::debug!("source {ssrc:08x} said BYE");
        Some(SessionEvent::SourceBye {
            ssrc,
            reason: reason.clone(),
        })
    }

    /// Marks every internal source as leaving.
    pub(crate) fn mark_bye(&mut self, reason: &Bytes) {
        for source in self.sources.values_mut().filter(|s| s.internal) {
            source.marked_bye = true;
            source.bye_reason = Some(reason.clone());
        }
    }

    /// Report blocks for this cycle, round robin over the validated remote
    /// senders so that every one of them is covered.
    pub(crate) fn report_blocks(&mut self, now: Duration) -> Vec<ReceptionReport> {
        let candidates: Vec<u32> = self
            .sources
            .values()
            .filter(|s| !s.internal && s.validated && s.is_sender && s.is_active())
            .map(|s| s.ssrc)
            .collect();
        if candidates.is_empty() {
            return vec![];
        }

        let mut eligible = self.eligible(&candidates);
        if eligible.is_empty() {
            self.rb_generation += 1;
            eligible = self.eligible(&candidates);
        }

        let generation = self.rb_generation + 1;
        let mut reports = Vec::with_capacity(MAX_REPORT_BLOCKS);
        for ssrc in eligible.into_iter().take(MAX_REPORT_BLOCKS) {
            if let Some(source) = self.sources.get_mut(&ssrc) {
                source.generation = generation;
                reports.push(source.generate_report(now));
            }
        }
        reports
    }

    fn eligible(&self, candidates: &[u32]) -> Vec<u32> {
        candidates
            .iter()
            .copied()
            .filter(|ssrc| {
                self.sources
                    .get(ssrc)
                    .map_or(false, |s| s.generation <= self.rb_generation)
            })
            .collect()
    }

    /// Drops every source whose BYE went out, except the current internal one
    /// which stays as a silent record.
    pub(crate) fn remove_sent_byes(&mut self) {
        let current = self.internal_ssrc;
        self.sources
            .retain(|ssrc, s| !s.sent_bye || (*ssrc == current && s.internal));
    }

    /// Times out silent sources and old collisions, and demotes quiet senders.
    pub(crate) fn sweep(
        &mut self,
        now: Duration,
        receiver_timeout: Duration,
        interval: Duration,
    ) -> Vec<SessionEvent> {
        let mut events = vec![];
        let current = self.internal_ssrc;
        let mut gone = vec![];

        self.conflicting.expire(now);
        for source in self.sources.values_mut() {
            source.conflicting.expire(now);
            if let Some(last_rtp) = source.last_rtp_activity {
                if source.is_sender && now.saturating_sub(last_rtp) > interval * 2 {
                    log::trace!("source {:08x} is no longer a sender", source.ssrc);
                    source.is_sender = false;
                }
            }

            let idle = now.saturating_sub(source.last_activity) > receiver_timeout;
            if source.internal {
                if source.ssrc != current && idle && !source.marked_bye {
                    log::debug!("internal source {:08x} timed out", source.ssrc);
                    source.marked_bye = true;
                    source.bye_reason = Some(Bytes::from_static(TIMEOUT_REASON));
                }
                continue;
            }

            if source.received_bye {
                gone.push(source.ssrc);
            } else if idle && !source.marked_bye {
                log::debug!("source {:08x} timed out", source.ssrc);
                gone.push(source.ssrc);
                events.push(SessionEvent::SourceTimeout(source.ssrc));
            }
        }

        for ssrc in gone {
            self.sources.remove(&ssrc);
        }
        events
    }
}
