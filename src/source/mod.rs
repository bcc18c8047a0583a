#[cfg(test)]
mod source_test;

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use rtcp::reception_report::ReceptionReport;
use rtcp::sender_report::SenderReport;
use rtcp::source_description::{SdesType, SourceDescriptionItem};

use crate::packet_info::RtpPacketInfo;

const RTP_SEQ_MOD: u32 = 1 << 16;
const MAX_DROPOUT: u16 = 3000;
const MAX_MISORDER: u16 = 100;
const MAX_TOTAL_LOST: i64 = 0xFFFFFF;
/// How long an address that caused a collision stays refused, ten times the
/// minimum RTCP interval (RFC 3550 8.2).
pub(crate) const COLLISION_TIMEOUT: Duration = Duration::from_secs(50);

/// Addresses that caused a collision, each with when it was last seen.
#[derive(Debug, Default, Clone)]
pub(crate) struct ConflictingAddresses(Vec<(SocketAddr, Duration)>);

impl ConflictingAddresses {
    pub(crate) fn contains(&self, addr: &SocketAddr) -> bool {
        self.0.iter().any(|(a, _)| a == addr)
    }

    /// Whether `addr` is a known conflict. A known one is refreshed.
    pub(crate) fn seen(&mut self, addr: &SocketAddr, now: Duration) -> bool {
        match self.0.iter_mut().find(|(a, _)| a == addr) {
            Some((_, at)) => {
                *at = now;
                true
            }
            None => false,
        }
    }

    pub(crate) fn add(&mut self, addr: SocketAddr, now: Duration) {
        if !self.seen(&addr, now) {
            self.0.push((addr, now));
        }
    }

    /// Forgets conflicts not seen for COLLISION_TIMEOUT.
    pub(crate) fn expire(&mut self, now: Duration) {
        self.0.retain(|(addr, at)| {
            let keep = now.saturating_sub(*at) <= COLLISION_TIMEOUT;
            if !keep {
                log::debug!("collision with {addr} timed out");
            }
            keep
        });
    }
}

pub(crate) fn unix2ntp(st: SystemTime) -> u64 {
    let u = st
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_secs(0))
        .as_nanos() as u64;
    let mut s = u / 1_000_000_000;
    s += 0x83AA7E80; //offset in seconds between unix epoch and ntp epoch
    let mut f = u % 1_000_000_000;
    f <<= 32;
    f /= 1_000_000_000;
    s <<= 32;

    s | f
}

/// Middle 32 bits of an NTP timestamp, the unit of LSR and DLSR arithmetic.
pub(crate) fn ntp_short(ntp: u64) -> u32 {
    (ntp >> 16) as u32
}

/// Key a SDES item is stored under in [`Source::sdes`].
pub(crate) fn sdes_key(item: &SourceDescriptionItem) -> Option<(String, String)> {
    match item.sdes_type {
        SdesType::SdesEnd => None,
        SdesType::SdesPrivate => {
            let (prefix, value) = item.private_parts()?;
            Some((
                format!("priv:{}", String::from_utf8_lossy(&prefix)),
                String::from_utf8_lossy(&value).into_owned(),
            ))
        }
        t => Some((
            t.to_string().to_lowercase(),
            String::from_utf8_lossy(&item.text).into_owned(),
        )),
    }
}

/// Snapshot of one source, handed out by `Session::source_stats`.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct SourceStats {
    pub ssrc: u32,
    pub internal: bool,
    pub validated: bool,
    pub is_sender: bool,
    pub address: Option<SocketAddr>,
    pub sdes: BTreeMap<String, String>,

    pub packets_received: u64,
    pub octets_received: u64,
    pub extended_max_seq: u32,
    pub cumulative_lost: u32,
    pub fraction_lost: u8,
    /// Interarrival jitter in RTP timestamp units.
    pub jitter: u32,
    pub packet_rate: f64,
    pub octet_rate: f64,

    pub packets_sent: u64,
    pub octets_sent: u64,

    /// Whether this remote sent us a report block about one of our sources.
    pub have_rb: bool,
    pub rb_ssrc: u32,
    pub rb_fraction_lost: u8,
    pub rb_total_lost: u32,
    pub rb_jitter: u32,
    pub round_trip_time: Option<Duration>,
}

/// One SSRC known to the session, local or remote.
#[derive(Debug, Default, Clone)]
pub struct Source {
    pub(crate) ssrc: u32,
    pub(crate) internal: bool,
    pub(crate) rtp_from: Option<SocketAddr>,
    pub(crate) rtcp_from: Option<SocketAddr>,
    /// Addresses that used to map to this SSRC and are now refused.
    pub(crate) conflicting: ConflictingAddresses,

    probation: u32,
    pub(crate) probation_remaining: u32,
    probation_queue: Vec<(RtpPacketInfo, Duration)>,
    pub(crate) validated: bool,
    /// NewSource was raised for it.
    pub(crate) announced: bool,

    pub(crate) last_activity: Duration,
    pub(crate) last_rtp_activity: Option<Duration>,
    pub(crate) is_sender: bool,

    pub(crate) received_bye: bool,
    pub(crate) marked_bye: bool,
    pub(crate) bye_reason: Option<Bytes>,
    pub(crate) sent_bye: bool,

    pub(crate) sdes: BTreeMap<String, String>,
    /// Round-robin generation of the last report block written for us.
    pub(crate) generation: u64,
    pub(crate) last_fir_seqnum: Option<u8>,
    pub(crate) clock_rate: u32,

    // reception, RFC 3550 A.1 and A.3
    started: bool,
    max_seq: u16,
    cycles: u32,
    base_seq: u32,
    bad_seq: u32,
    received: u64,
    octets_received: u64,
    expected_prior: u64,
    received_prior: u64,
    last_transit: Option<f64>,
    jitter: f64,
    fraction_lost: u8,
    cumulative_lost: u32,
    packets_since_report: u64,
    octets_since_report: u64,
    last_report_at: Option<Duration>,
    packet_rate: f64,
    octet_rate: f64,
    last_sr: u32,
    last_sr_at: Option<Duration>,

    // sending
    pub(crate) packets_sent: u64,
    pub(crate) octets_sent: u64,
    last_rtp_timestamp: u32,
    last_rtp_sent_at: Option<Duration>,
    pub(crate) sent_since_report: bool,

    // what this remote reported about us
    rb: Option<ReceptionReport>,
    round_trip_time: Option<Duration>,
}

impl Source {
    pub(crate) fn new(ssrc: u32, probation: u32, now: Duration) -> Self {
        Source {
            ssrc,
            probation,
            probation_remaining: probation,
            validated: probation == 0,
            last_activity: now,
            ..Default::default()
        }
    }

    pub(crate) fn new_internal(ssrc: u32, now: Duration) -> Self {
        Source {
            ssrc,
            internal: true,
            validated: true,
            last_activity: now,
            ..Default::default()
        }
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    /// address returns where RTP comes from, falling back to the RTCP origin.
    pub fn address(&self) -> Option<SocketAddr> {
        self.rtp_from.or(self.rtcp_from)
    }

    pub(crate) fn set_address(&mut self, addr: SocketAddr, is_rtcp: bool) {
        if is_rtcp {
            self.rtcp_from = Some(addr);
        } else {
            self.rtp_from = Some(addr);
        }
    }

    pub(crate) fn known_address(&self, is_rtcp: bool) -> Option<SocketAddr> {
        if is_rtcp {
            self.rtcp_from
        } else {
            self.rtp_from
        }
    }

    pub(crate) fn is_active(&self) -> bool {
        !self.received_bye && !self.marked_bye
    }

    pub(crate) fn store_sdes(&mut self, items: &[SourceDescriptionItem]) {
        for item in items {
            if let Some((key, value)) = sdes_key(item) {
                self.sdes.insert(key, value);
            }
        }
    }

    fn init_seq(&mut self, seq: u16) {
        self.base_seq = seq as u32;
        self.max_seq = seq;
        self.bad_seq = RTP_SEQ_MOD + 1;
        self.cycles = 0;
        self.received = 0;
        self.received_prior = 0;
        self.expected_prior = 0;
    }

    /// Feeds one RTP packet through probation and the reception statistics.
    /// Returns the packets that may be delivered, in order.
    pub(crate) fn process_rtp(
        &mut self,
        pkt: RtpPacketInfo,
        now: Duration,
    ) -> Vec<RtpPacketInfo> {
        self.last_activity = now;
        self.last_rtp_activity = Some(now);
        self.is_sender = true;
        if pkt.clock_rate != 0 {
            self.clock_rate = pkt.clock_rate;
        }

        if !self.started {
            self.started = true;
            self.max_seq = pkt.sequence_number.wrapping_sub(1);
            if self.validated {
                self.init_seq(pkt.sequence_number);
            }
        }

        if !self.validated {
            return self.probe(pkt, now);
        }

        if self.update_seq(pkt.sequence_number) {
            self.record_arrival(&pkt, now);
            vec![pkt]
        } else {
            log::debug!(
                "ssrc {:08x}: dropping seq {} far from {}",
                self.ssrc,
                pkt.sequence_number,
                self.max_seq
            );
            vec![]
        }
    }

    fn probe(&mut self, pkt: RtpPacketInfo, now: Duration) -> Vec<RtpPacketInfo> {
        let seq = pkt.sequence_number;
        if seq == self.max_seq.wrapping_add(1) {
            self.probation_remaining = self.probation_remaining.saturating_sub(1);
            self.max_seq = seq;
            self.probation_queue.push((pkt, now));
        } else {
            log::trace!(
                "ssrc {:08x}: probation restarted at seq {}",
                self.ssrc,
                seq
            );
            // the first packet of a new run counts as one
            self.probation_remaining = self.probation.saturating_sub(1);
            self.probation_queue.clear();
            self.probation_queue.push((pkt, now));
            self.max_seq = seq;
        }

        if self.probation_remaining > 0 {
            return vec![];
        }

        self.validated = true;
        let queued = std::mem::take(&mut self.probation_queue);
        if let Some((first, _)) = queued.first() {
            self.init_seq(first.sequence_number);
        }
        log::debug!(
            "ssrc {:08x}: probation done, releasing {} packets",
            self.ssrc,
            queued.len()
        );

        let mut out = Vec::with_capacity(queued.len());
        for (p, at) in queued {
            if self.update_seq(p.sequence_number) {
                self.record_arrival(&p, at);
                out.push(p);
            }
        }
        out
    }

    /// RFC 3550 A.1 for a validated source.
    fn update_seq(&mut self, seq: u16) -> bool {
        let udelta = seq.wrapping_sub(self.max_seq);

        if udelta < MAX_DROPOUT {
            // in order, with permissible gap
            if seq < self.max_seq {
                self.cycles += RTP_SEQ_MOD;
            }
            self.max_seq = seq;
        } else if udelta as u32 <= RTP_SEQ_MOD - MAX_MISORDER as u32 {
            // the sequence number made a very large jump
            if seq as u32 == self.bad_seq {
                // two sequential packets, assume the other side restarted
                self.init_seq(seq);
            } else {
                self.bad_seq = (seq as u32 + 1) & (RTP_SEQ_MOD - 1);
                return false;
            }
        }
        // duplicate or reordered packets are counted

        self.received += 1;
        true
    }

    fn record_arrival(&mut self, pkt: &RtpPacketInfo, now: Duration) {
        self.octets_received += pkt.payload_size as u64;
        self.packets_since_report += 1;
        self.octets_since_report += pkt.payload_size as u64;

        if self.clock_rate == 0 {
            return;
        }

        // RFC 3550 A.8
        let arrival = now.as_secs_f64() * self.clock_rate as f64;
        let transit = arrival - pkt.timestamp as f64;
        if let Some(last_transit) = self.last_transit {
            let d = transit - last_transit;
            self.jitter += (d.abs() - self.jitter) / 16.0;
        }
        self.last_transit = Some(transit);
    }

    pub(crate) fn extended_max_seq(&self) -> u32 {
        self.cycles.wrapping_add(self.max_seq as u32)
    }

    fn expected(&self) -> i64 {
        self.extended_max_seq() as i64 - self.base_seq as i64 + 1
    }

    pub(crate) fn process_sender_report(&mut self, sr: &SenderReport, now: Duration) {
        self.last_sr = ntp_short(sr.ntp_time);
        self.last_sr_at = Some(now);
        self.is_sender = true;
    }

    /// Stores a report block this source sent about `ntp_now`'s local side.
    pub(crate) fn process_report_block(&mut self, rb: &ReceptionReport, ntp_now: u64) {
        if rb.last_sender_report != 0 {
            let rtt = ntp_short(ntp_now)
                .wrapping_sub(rb.delay)
                .wrapping_sub(rb.last_sender_report);
            // 16.16 fixed point seconds
            self.round_trip_time = Some(Duration::from_secs_f64(rtt as f64 / 65536.0));
        }
        self.rb = Some(rb.clone());
    }

    /// Builds the report block for this source and starts a new reporting
    /// interval (RFC 3550 A.3).
    pub(crate) fn generate_report(&mut self, now: Duration) -> ReceptionReport {
        let expected = self.expected();
        let lost = (expected - self.received as i64).clamp(0, MAX_TOTAL_LOST);

        let expected_interval = expected - self.expected_prior as i64;
        self.expected_prior = expected.max(0) as u64;
        let received_interval = self.received as i64 - self.received_prior as i64;
        self.received_prior = self.received;
        let lost_interval = expected_interval - received_interval;

        self.fraction_lost = if expected_interval <= 0 || lost_interval <= 0 {
            0
        } else {
            ((lost_interval << 8) / expected_interval).min(255) as u8
        };
        self.cumulative_lost = lost as u32;

        if let Some(last) = self.last_report_at {
            let elapsed = now.saturating_sub(last).as_secs_f64();
            if elapsed > 0.0 {
                self.packet_rate = self.packets_since_report as f64 / elapsed;
                self.octet_rate = self.octets_since_report as f64 / elapsed;
            }
        }
        self.last_report_at = Some(now);
        self.packets_since_report = 0;
        self.octets_since_report = 0;

        let delay = match self.last_sr_at {
            Some(at) => (now.saturating_sub(at).as_secs_f64() * 65536.0) as u32,
            None => 0,
        };

        ReceptionReport {
            ssrc: self.ssrc,
            fraction_lost: self.fraction_lost,
            total_lost: self.cumulative_lost,
            last_sequence_number: self.extended_max_seq(),
            jitter: self.jitter as u32,
            last_sender_report: self.last_sr,
            delay,
        }
    }

    pub(crate) fn record_sent(
        &mut self,
        rtp_timestamp: u32,
        clock_rate: u32,
        size: usize,
        now: Duration,
    ) {
        self.packets_sent += 1;
        self.octets_sent += size as u64;
        self.last_rtp_timestamp = rtp_timestamp;
        self.last_rtp_sent_at = Some(now);
        if clock_rate != 0 {
            self.clock_rate = clock_rate;
        }
        self.sent_since_report = true;
        self.is_sender = true;
        self.last_activity = now;
        self.last_rtp_activity = Some(now);
    }

    /// RTP timestamp matching `now`, projected from the last sent packet.
    pub(crate) fn rtp_time_at(&self, now: Duration) -> u32 {
        match self.last_rtp_sent_at {
            Some(at) => {
                let elapsed = now.saturating_sub(at).as_secs_f64() * self.clock_rate as f64;
                self.last_rtp_timestamp.wrapping_add(elapsed as u32)
            }
            None => self.last_rtp_timestamp,
        }
    }

    pub(crate) fn stats(&self) -> SourceStats {
        let rb = self.rb.clone().unwrap_or_default();
        SourceStats {
            ssrc: self.ssrc,
            internal: self.internal,
            validated: self.validated,
            is_sender: self.is_sender,
            address: self.address(),
            sdes: self.sdes.clone(),
            packets_received: self.received,
            octets_received: self.octets_received,
            extended_max_seq: self.extended_max_seq(),
            cumulative_lost: self.cumulative_lost,
            fraction_lost: self.fraction_lost,
            jitter: self.jitter as u32,
            packet_rate: self.packet_rate,
            octet_rate: self.octet_rate,
            packets_sent: self.packets_sent,
            octets_sent: self.octets_sent,
            have_rb: self.rb.is_some(),
            rb_ssrc: rb.ssrc,
            rb_fraction_lost: rb.fraction_lost,
            rb_total_lost: rb.total_lost,
            rb_jitter: rb.jitter,
            round_trip_time: self.round_trip_time,
        }
    }
}
