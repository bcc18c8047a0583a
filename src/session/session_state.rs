use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use rtcp::application_defined::ApplicationDefined;
use rtcp::goodbye::Goodbye;
use rtcp::packet::Packet;
use rtcp::payload_feedbacks::full_intra_request::FullIntraRequest;
use rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use rtcp::receiver_report::ReceiverReport;
use rtcp::reception_report::ReceptionReport;
use rtcp::sender_report::SenderReport;
use rtcp::source_description::SourceDescription;
use rtcp::transport_feedbacks::transport_layer_cc::TransportLayerCc;
use rtcp::transport_feedbacks::transport_layer_nack::TransportLayerNack;
use util::marshal::{Marshal, MarshalSize};

use crate::compound::{
    write_report_head, CompoundBuilder, LocalDescription, PendingApp, PendingFeedback,
};
use crate::config::SessionConfig;
use crate::error::{Error, Result};
use crate::event::SessionEvent;
use crate::nack::{NackAggregator, NackFciBuilder};
use crate::packet_info::RtpPacketInfo;
use crate::scheduler::{Membership, RtcpKind, RtcpScheduler};
use crate::source::{unix2ntp, SourceStats};
use crate::source_table::{CollisionAction, SourceTable};
use crate::twcc::{TwccDecoder, TwccEncoder, TwccSendLog, TwccStats};

/// How long finalized transport-wide feedback may wait for an RTCP packet.
const TWCC_MAX_DELAY: Duration = Duration::from_millis(100);
/// How long a key unit request may wait for an RTCP packet.
const KEY_UNIT_MAX_DELAY: Duration = Duration::from_secs(5);
const MIN_RECEIVER_TIMEOUT: Duration = Duration::from_secs(5);
const RECEIVER_TIMEOUT_INTERVALS: u32 = 5;

/// SessionState is everything a session mutates. Every operation takes the
/// current session time, there is no clock in here.
pub(crate) struct SessionState {
    config: SessionConfig,
    table: SourceTable,
    nack: NackAggregator,
    feedback: PendingFeedback,
    twcc_encoder: TwccEncoder,
    twcc_decoder: TwccDecoder,
    twcc_send_log: TwccSendLog,
    /// Finalized transport-wide feedback waiting for room in an RTCP packet.
    twcc_pending: VecDeque<TransportLayerCc>,
    scheduler: RtcpScheduler,
    /// An early RTCP wanted once retransmission requests become due, with
    /// the delay they tolerate from then on.
    deferred_early: Option<(Duration, Duration)>,
    events: Vec<SessionEvent>,
    local: LocalDescription,
    /// Wall clock at session time zero.
    ntp_epoch: SystemTime,
}

impl SessionState {
    pub(crate) fn new(config: SessionConfig, now: Duration) -> Self {
        let table = SourceTable::new(
            config.internal_ssrc,
            config.probation,
            config.favor_new,
            now,
        );
        let local = LocalDescription {
            cname: Bytes::from(config.cname.clone()),
            items: config.sdes_items.clone(),
        };
        let ntp_epoch = SystemTime::now()
            .checked_sub(now)
            .unwrap_or(SystemTime::UNIX_EPOCH);

        SessionState {
            twcc_encoder: TwccEncoder::new(config.twcc_feedback_interval),
            scheduler: RtcpScheduler::new(&config),
            table,
            nack: NackAggregator::default(),
            feedback: PendingFeedback::default(),
            twcc_decoder: TwccDecoder::new(),
            twcc_send_log: TwccSendLog::default(),
            twcc_pending: VecDeque::new(),
            deferred_early: None,
            events: vec![],
            local,
            ntp_epoch,
            config,
        }
    }

    pub(crate) fn internal_ssrc(&self) -> u32 {
        self.table.internal_ssrc()
    }

    pub(crate) fn source_stats(&self, ssrc: u32) -> Option<SourceStats> {
        self.table.get(ssrc).map(|s| s.stats())
    }

    pub(crate) fn set_nack_fci_builder(&mut self, builder: Option<Arc<dyn NackFciBuilder>>) {
        self.nack.set_fci_builder(builder);
    }

    pub(crate) fn take_events(&mut self) -> Vec<SessionEvent> {
        std::mem::take(&mut self.events)
    }

    fn membership(&self) -> Membership {
        Membership {
            members: self.table.members(),
            senders: self.table.senders(),
            we_sent: self.table.we_sent(),
        }
    }

    fn ntp_now(&self, now: Duration) -> u64 {
        unix2ntp(self.ntp_epoch + now)
    }

    fn receiver_timeout(&self, interval: Duration) -> Duration {
        self.config
            .receiver_timeout
            .unwrap_or_else(|| (interval * RECEIVER_TIMEOUT_INTERVALS).max(MIN_RECEIVER_TIMEOUT))
    }

    fn on_collision(&mut self, ssrc: u32, new_ssrc: u32, now: Duration) {
        self.events.push(SessionEvent::SsrcCollision { ssrc, new_ssrc });
        let m = self.membership();
        self.scheduler.schedule_bye(now, m);
    }

    /// Runs the collision check for an SSRC named in RTCP. Returns whether the
    /// packet may be processed.
    fn admit_rtcp(&mut self, ssrc: u32, from: Option<SocketAddr>, now: Duration) -> bool {
        match self.table.on_receive(ssrc, from, true, now) {
            CollisionAction::Ignore => true,
            CollisionAction::Rename(new_ssrc) => {
                self.on_collision(ssrc, new_ssrc, now);
                false
            }
            CollisionAction::Drop => false,
        }
    }

    /// process_rtp accounts a received RTP packet. Returns the packets that may
    /// be delivered, several when probation completes and none while it lasts
    /// or when the packet collides.
    pub(crate) fn process_rtp(&mut self, pkt: RtpPacketInfo, now: Duration) -> Vec<RtpPacketInfo> {
        let ssrc = pkt.ssrc;
        match self.table.on_receive(ssrc, pkt.address, false, now) {
            CollisionAction::Ignore => {}
            CollisionAction::Rename(new_ssrc) => {
                self.on_collision(ssrc, new_ssrc, now);
                return vec![];
            }
            CollisionAction::Drop => return vec![],
        }

        let twcc = pkt.twcc_sequence_number;
        let marker = pkt.marker;
        let released = match self.table.get_mut(ssrc) {
            Some(source) if !source.internal => {
                let released = source.process_rtp(pkt, now);
                if source.validated && !source.announced {
                    source.announced = true;
                    self.events.push(SessionEvent::NewSource(ssrc));
                }
                released
            }
            _ => return vec![],
        };

        if let Some(seqnum) = twcc {
            if self.twcc_encoder.record(ssrc, seqnum, now, marker) {
                self.finalize_twcc();
                self.request_early_rtcp(now, TWCC_MAX_DELAY);
            }
        }

        let m = self.membership();
        self.scheduler.start(now, m);
        released
    }

    fn finalize_twcc(&mut self) {
        let sender_ssrc = self.table.internal_ssrc();
        self.twcc_pending
            .extend(self.twcc_encoder.build_feedback(sender_ssrc));
    }

    /// process_rtcp parses a received compound packet and applies it. A packet
    /// that does not parse changes nothing.
    pub(crate) fn process_rtcp(
        &mut self,
        data: &Bytes,
        from: Option<SocketAddr>,
        now: Duration,
    ) -> Result<()> {
        let mut buf = data.clone();
        let packets = rtcp::packet::unmarshal(&mut buf)
            .map_err(|err| Error::MalformedPacket(err.to_string()))?;

        for p in &packets {
            self.process_rtcp_packet(&**p, from, now);
        }

        let m = self.membership();
        self.scheduler.start(now, m);
        Ok(())
    }

    fn process_rtcp_packet(
        &mut self,
        p: &(dyn Packet + Send + Sync),
        from: Option<SocketAddr>,
        now: Duration,
    ) {
        let any = p.as_any();
        if let Some(sr) = any.downcast_ref::<SenderReport>() {
            if self.admit_rtcp(sr.ssrc, from, now) {
                if let Some(source) = self.table.get_mut(sr.ssrc) {
                    source.process_sender_report(sr, now);
                }
                self.process_report_blocks(sr.ssrc, &sr.reports, now);
            }
        } else if let Some(rr) = any.downcast_ref::<ReceiverReport>() {
            if self.admit_rtcp(rr.ssrc, from, now) {
                self.process_report_blocks(rr.ssrc, &rr.reports, now);
            }
        } else if let Some(sdes) = any.downcast_ref::<SourceDescription>() {
            for chunk in &sdes.chunks {
                if !self.admit_rtcp(chunk.source, from, now) {
                    continue;
                }
                if let Some(source) = self.table.get_mut(chunk.source) {
                    source.store_sdes(&chunk.items);
                }
            }
        } else if let Some(bye) = any.downcast_ref::<Goodbye>() {
            for ssrc in &bye.sources {
                if let Some(event) = self.table.on_bye(*ssrc, &bye.reason, from, now) {
                    self.nack.forget(*ssrc);
                    self.events.push(event);
                }
            }
        } else if let Some(app) = any.downcast_ref::<ApplicationDefined>() {
            if self.admit_rtcp(app.ssrc, from, now) {
                self.events.push(SessionEvent::AppPacket {
                    subtype: app.sub_type,
                    ssrc: app.ssrc,
                    name: app.name.clone(),
                    data: app.data.clone(),
                });
            }
        } else if let Some(pli) = any.downcast_ref::<PictureLossIndication>() {
            if self.table.is_internal(pli.media_ssrc)
                && self.admit_rtcp(pli.sender_ssrc, from, now)
            {
                self.events.push(SessionEvent::ForceKeyUnit {
                    ssrc: pli.media_ssrc,
                    sender_ssrc: pli.sender_ssrc,
                    fir: false,
                });
            }
        } else if let Some(fir) = any.downcast_ref::<FullIntraRequest>() {
            self.process_fir(fir, from, now);
        } else if let Some(nack) = any.downcast_ref::<TransportLayerNack>() {
            if self.table.is_internal(nack.media_ssrc)
                && self.admit_rtcp(nack.sender_ssrc, from, now)
            {
                for seqnum in nack.sequence_numbers() {
                    self.events.push(SessionEvent::RetransmissionRequest {
                        ssrc: nack.media_ssrc,
                        sender_ssrc: nack.sender_ssrc,
                        seqnum,
                    });
                }
            }
        } else if let Some(tlcc) = any.downcast_ref::<TransportLayerCc>() {
            self.process_twcc(tlcc);
        } else {
            log::trace!("ignoring rtcp packet {:?}", p.header().packet_type);
        }
    }

    /// Report blocks `sender` wrote about our own sources.
    fn process_report_blocks(&mut self, sender: u32, reports: &[ReceptionReport], now: Duration) {
        let ntp_now = self.ntp_now(now);
        for rb in reports {
            if !self.table.is_internal(rb.ssrc) {
                continue;
            }
            if let Some(source) = self.table.get_mut(sender) {
                source.process_report_block(rb, ntp_now);
            }
        }
    }

    fn process_fir(&mut self, fir: &FullIntraRequest, from: Option<SocketAddr>, now: Duration) {
        let ours: Vec<_> = fir
            .fir
            .iter()
            .filter(|entry| self.table.is_internal(entry.ssrc))
            .copied()
            .collect();
        if ours.is_empty() || !self.admit_rtcp(fir.sender_ssrc, from, now) {
            return;
        }

        for entry in ours {
            if let Some(sender) = self.table.get_mut(fir.sender_ssrc) {
                if sender.last_fir_seqnum == Some(entry.sequence_number) {
                    log::trace!(
                        "duplicate fir {} from {:08x}",
                        entry.sequence_number,
                        fir.sender_ssrc
                    );
                    continue;
                }
                sender.last_fir_seqnum = Some(entry.sequence_number);
            }
            self.events.push(SessionEvent::ForceKeyUnit {
                ssrc: entry.ssrc,
                sender_ssrc: fir.sender_ssrc,
                fir: true,
            });
        }
    }

    fn process_twcc(&mut self, tlcc: &TransportLayerCc) {
        let statuses = match self.twcc_decoder.decode(tlcc) {
            Ok(statuses) => statuses,
            Err(err) => {
                log::debug!("dropping twcc feedback from {:08x}: {err}", tlcc.sender_ssrc);
                return;
            }
        };
        let packets = self.twcc_send_log.join(&statuses);
        let stats = TwccStats::from_packets(&packets);
        self.events.push(SessionEvent::TwccPackets(packets));
        self.events.push(SessionEvent::TwccStats(stats));
    }

    /// send_rtp accounts a packet we are about to send.
    pub(crate) fn send_rtp(&mut self, pkt: &RtpPacketInfo, now: Duration) -> Result<()> {
        self.table.on_send(pkt, now)?;
        if let Some(seqnum) = pkt.twcc_sequence_number {
            self.twcc_send_log
                .record(seqnum, now, pkt.payload_size, pkt.payload_type);
        }
        let m = self.membership();
        self.scheduler.start(now, m);
        Ok(())
    }

    /// request_key_unit queues a FIR or a PLI for `media_ssrc`. Returns false
    /// when the source is not a known remote one.
    pub(crate) fn request_key_unit(&mut self, media_ssrc: u32, fir: bool, now: Duration) -> bool {
        match self.table.get(media_ssrc) {
            Some(source) if !source.internal => {}
            _ => return false,
        }
        if fir {
            self.feedback.request_fir(media_ssrc);
        } else {
            self.feedback.request_pli(media_ssrc);
        }
        if !self.request_early_rtcp(now, KEY_UNIT_MAX_DELAY) {
            log::debug!("key unit request for {media_ssrc:08x} waits for the regular rtcp");
        }
        true
    }

    /// request_nack asks for a retransmission of `seqnum` once `delay` passed.
    /// The request should go out no later than `max_delay` after that.
    pub(crate) fn request_nack(
        &mut self,
        media_ssrc: u32,
        seqnum: u16,
        delay: Duration,
        max_delay: Duration,
        now: Duration,
    ) {
        let due = now + delay;
        self.nack
            .request(media_ssrc, seqnum, now, delay, Some(due + max_delay));
        if delay.is_zero() {
            self.request_early_rtcp(now, max_delay);
            return;
        }
        self.deferred_early = Some(match self.deferred_early {
            Some((at, tolerated)) => (at.min(due), tolerated.min(max_delay)),
            None => (due, max_delay),
        });
    }

    pub(crate) fn request_early_rtcp(&mut self, now: Duration, max_delay: Duration) -> bool {
        let m = self.membership();
        self.scheduler.request_early(now, max_delay, m)
    }

    /// send_app queues an application defined packet for the next RTCP.
    pub(crate) fn send_app(&mut self, sub_type: u8, name: &str, data: Bytes) -> Result<()> {
        let app = ApplicationDefined {
            sub_type,
            ssrc: self.table.internal_ssrc(),
            name: name.to_owned(),
            data,
        };
        app.marshal()?;
        self.feedback.queue_app(PendingApp {
            sub_type,
            name: app.name,
            data: app.data,
        });
        Ok(())
    }

    /// schedule_bye makes every internal source leave with `reason` at the
    /// next RTCP.
    pub(crate) fn schedule_bye(&mut self, reason: &str, now: Duration) {
        self.table.mark_bye(&Bytes::from(reason.to_owned()));
        let m = self.membership();
        self.scheduler.schedule_bye(now, m);
    }

    /// When on_timer has something to do next.
    pub(crate) fn next_check(&self) -> Option<Duration> {
        [
            self.scheduler.next_check(),
            self.twcc_encoder.due_at(),
            self.deferred_early.map(|(at, _)| at),
        ]
        .into_iter()
        .flatten()
        .min()
    }

    /// on_timer runs everything that is due at `now` and returns the RTCP
    /// packets to send, one per reporting internal source.
    pub(crate) fn on_timer(&mut self, now: Duration) -> Vec<Bytes> {
        if self.twcc_encoder.due_at().map_or(false, |due| due <= now) {
            self.finalize_twcc();
            self.request_early_rtcp(now, TWCC_MAX_DELAY);
        }
        if let Some((at, max_delay)) = self.deferred_early {
            if at <= now {
                self.deferred_early = None;
                self.request_early_rtcp(now, max_delay);
            }
        }

        let m = self.membership();
        let kind = match self.scheduler.poll(now, m) {
            Some(kind) => kind,
            None => return vec![],
        };

        if kind == RtcpKind::Regular {
            let interval = self.scheduler.deterministic_interval(m);
            let timeout = self.receiver_timeout(interval);
            let events = self.table.sweep(now, timeout, interval);
            self.events.extend(events);
        }
        self.build_round(now, kind)
    }

    /// send_rtcp_now builds and returns an RTCP round regardless of pacing.
    pub(crate) fn send_rtcp_now(&mut self, now: Duration) -> Result<Vec<Bytes>> {
        self.scheduler.force()?;
        Ok(self.build_round(now, RtcpKind::Regular))
    }

    fn build_round(&mut self, now: Duration, kind: RtcpKind) -> Vec<Bytes> {
        if kind == RtcpKind::Regular && !self.twcc_encoder.is_empty() {
            self.finalize_twcc();
        }

        let ntp_now = self.ntp_now(now);
        let current = self.table.internal_ssrc();
        let mut out = vec![];
        let mut size = 0;
        for ssrc in self.table.reporting_internal() {
            let mut compound = CompoundBuilder::new(self.config.mtu);
            write_report_head(
                &mut compound,
                &mut self.table,
                ssrc,
                &self.local,
                now,
                ntp_now,
            );
            if ssrc == current {
                self.write_feedback(ssrc, &mut compound, now);
            }
            log::trace!(
                "rtcp for {ssrc:08x}: {} packets in {} bytes",
                compound.len(),
                compound.size()
            );
            match compound.finish() {
                Ok(data) => {
                    size += data.len();
                    out.push(data);
                }
                Err(err) => log::warn!("failed to build rtcp for {ssrc:08x}: {err}"),
            }
        }
        self.table.remove_sent_byes();

        let m = self.membership();
        self.scheduler.on_sent(now, kind, size, m);
        out
    }

    /// Everything after the report head: FIR, PLI, NACK, TWCC and APP.
    fn write_feedback(&mut self, ssrc: u32, out: &mut CompoundBuilder, now: Duration) {
        let table = &self.table;
        self.feedback.retain(|media| table.get(media).is_some());
        if let Err(err) = self.feedback.write_key_unit_requests(ssrc, out) {
            log::debug!("key unit requests: {err}");
        }
        if let Err(err) = self
            .nack
            .write_feedback(ssrc, out, now, |media| table.get(media).is_some())
        {
            log::debug!("nacks: {err}, {} still pending", self.nack.len());
        }

        while let Some(mut tlcc) = self.twcc_pending.pop_front() {
            tlcc.sender_ssrc = ssrc;
            let size = tlcc.marshal_size();
            if out.try_push(Box::new(tlcc.clone())) {
                continue;
            }
            if size > self.config.mtu {
                log::warn!("dropping twcc feedback of {size} bytes, larger than the mtu");
                continue;
            }
            self.twcc_pending.push_front(tlcc);
            log::debug!("{} twcc feedbacks deferred", self.twcc_pending.len());
            break;
        }

        if let Err(err) = self.feedback.write_apps(ssrc, out) {
            log::debug!("app packets: {err}");
        }
    }
}
