
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::time::Duration;

use bytes::Bytes;
use rtcp::application_defined::ApplicationDefined;
use rtcp::compound_packet::CompoundPacket;
use rtcp::goodbye::Goodbye;
use rtcp::header::COUNT_MAX;
use rtcp::packet::Packet;
use rtcp::payload_feedbacks::full_intra_request::{FirEntry, FullIntraRequest};
use rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use rtcp::receiver_report::ReceiverReport;
use rtcp::sender_report::SenderReport;
use rtcp::source_description::{
    SdesType, SourceDescription, SourceDescriptionChunk, SourceDescriptionItem,
};
use util::marshal::Marshal;

use crate::error::{Error, Result};
use crate::source_table::{SourceTable, COLLISION_REASON};

/// CompoundBuilder assembles one RTCP datagram without exceeding `max_bytes`.
///
/// The mandatory head (report and SDES, BYE) is always taken. Everything after it
/// is only added when it fits, the caller keeps what was refused for the next
/// opportunity.
pub(crate) struct CompoundBuilder {
    packets: Vec<Box<dyn Packet + Send + Sync>>,
    size: usize,
    max_bytes: usize,
}

impl CompoundBuilder {
    pub(crate) fn new(max_bytes: usize) -> Self {
        CompoundBuilder {
            packets: vec![],
            size: 0,
            max_bytes,
        }
    }

    pub(crate) fn push_mandatory(&mut self, packet: Box<dyn Packet + Send + Sync>) {
        self.size += packet.marshal_size();
        self.packets.push(packet);
    }

    /// try_push adds `packet` if it still fits.
    pub(crate) fn try_push(&mut self, packet: Box<dyn Packet + Send + Sync>) -> bool {
        let size = packet.marshal_size();
        if self.size + size > self.max_bytes {
            return false;
        }
        self.size += size;
        self.packets.push(packet);
        true
    }

    pub(crate) fn remaining(&self) -> usize {
        self.max_bytes.saturating_sub(self.size)
    }

    pub(crate) fn size(&self) -> usize {
        self.size
    }

    pub(crate) fn len(&self) -> usize {
        self.packets.len()
    }

    pub(crate) fn finish(self) -> Result<Bytes> {
        let compound = CompoundPacket(self.packets);
        Ok(compound.marshal()?)
    }
}

/// Application defined packet queued by `send_app`.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct PendingApp {
    pub(crate) sub_type: u8,
    pub(crate) name: String,
    pub(crate) data: Bytes,
}

/// PendingFeedback holds the payload specific feedback and APP packets waiting
/// for the next RTCP.
#[derive(Debug, Default)]
pub(crate) struct PendingFeedback {
    pli: BTreeSet<u32>,
    fir: BTreeSet<u32>,
    /// Next FIR command sequence number per target.
    fir_seqnum: BTreeMap<u32, u8>,
    apps: VecDeque<PendingApp>,
}

impl PendingFeedback {
    /// A pending FIR for the same source already asks for more.
    pub(crate) fn request_pli(&mut self, media_ssrc: u32) {
        if !self.fir.contains(&media_ssrc) {
            self.pli.insert(media_ssrc);
        }
    }

    /// request_fir asks `media_ssrc` for a key frame and replaces a pending PLI.
    /// Repeating a pending request keeps its sequence number.
    pub(crate) fn request_fir(&mut self, media_ssrc: u32) {
        self.pli.remove(&media_ssrc);
        if self.fir.insert(media_ssrc) {
            log::trace!("fir for {media_ssrc:08x} queued");
        }
    }

    pub(crate) fn queue_app(&mut self, app: PendingApp) {
        self.apps.push_back(app);
    }

    /// Drops requests for sources we no longer know.
    pub(crate) fn retain(&mut self, known: impl Fn(u32) -> bool) {
        self.pli.retain(|ssrc| known(*ssrc));
        self.fir.retain(|ssrc| known(*ssrc));
    }

    /// FIR sequence number of the next request to `ssrc`, 1 for the first.
    fn next_fir_seqnum(&self, ssrc: u32) -> u8 {
        self.fir_seqnum.get(&ssrc).map_or(1, |seq| seq.wrapping_add(1))
    }

    /// Writes FIR and PLI into `out` as far as they fit.
    pub(crate) fn write_key_unit_requests(
        &mut self,
        sender_ssrc: u32,
        out: &mut CompoundBuilder,
    ) -> Result<()> {
        let mut deferred = 0;

        if !self.fir.is_empty() {
            let fir = FullIntraRequest {
                sender_ssrc,
                media_ssrc: 0,
                fir: self
                    .fir
                    .iter()
                    .map(|ssrc| FirEntry {
                        ssrc: *ssrc,
                        sequence_number: self.next_fir_seqnum(*ssrc),
                    })
                    .collect(),
            };
            if out.try_push(Box::new(fir)) {
                for ssrc in std::mem::take(&mut self.fir) {
                    let seq = self.next_fir_seqnum(ssrc);
                    self.fir_seqnum.insert(ssrc, seq);
                }
            } else {
                deferred += self.fir.len();
            }
        }

        let pli = std::mem::take(&mut self.pli);
        for media_ssrc in pli {
            let pkt = PictureLossIndication {
                sender_ssrc,
                media_ssrc,
            };
            if !out.try_push(Box::new(pkt)) {
                self.pli.insert(media_ssrc);
                deferred += 1;
            }
        }

        if deferred > 0 {
            Err(Error::CapacityExceeded(deferred))
        } else {
            Ok(())
        }
    }

    /// Writes queued APP packets in order, stopping at the first that does not fit.
    pub(crate) fn write_apps(&mut self, ssrc: u32, out: &mut CompoundBuilder) -> Result<()> {
        while let Some(app) = self.apps.front() {
            let pkt = ApplicationDefined {
                sub_type: app.sub_type,
                ssrc,
                name: app.name.clone(),
                data: app.data.clone(),
            };
            if !out.try_push(Box::new(pkt)) {
                return Err(Error::CapacityExceeded(self.apps.len()));
            }
            self.apps.pop_front();
        }
        Ok(())
    }
}

/// Who we are in SDES.
#[derive(Debug, Clone, Default)]
pub(crate) struct LocalDescription {
    pub(crate) cname: Bytes,
    pub(crate) items: Vec<SourceDescriptionItem>,
}

impl LocalDescription {
    fn sdes(&self, ssrc: u32) -> SourceDescription {
        let mut items = Vec::with_capacity(self.items.len() + 1);
        items.push(SourceDescriptionItem::new(
            SdesType::SdesCname,
            self.cname.clone(),
        ));
        items.extend(self.items.iter().cloned());
        SourceDescription {
            chunks: vec![SourceDescriptionChunk {
                source: ssrc,
                items,
            }],
        }
    }
}

/// Writes the mandatory head of the compound for internal source `ssrc`: SR or
/// RR, SDES and, when the source leaves, its BYE. Report blocks and the BYEs of
/// remote sources we refused to send on only go with the current source.
pub(crate) fn write_report_head(
    out: &mut CompoundBuilder,
    table: &mut SourceTable,
    ssrc: u32,
    local: &LocalDescription,
    now: Duration,
    ntp_now: u64,
) {
    let current = ssrc == table.internal_ssrc();
    let reports = if current {
        table.report_blocks(now)
    } else {
        vec![]
    };

    let (sent_since_report, bye) = match table.get(ssrc) {
        Some(source) => (
            source.sent_since_report,
            if source.marked_bye {
                Some(source.bye_reason.clone().unwrap_or_default())
            } else {
                None
            },
        ),
        None => (false, None),
    };

    if sent_since_report {
        let mut sr = SenderReport {
            ssrc,
            ntp_time: ntp_now,
            reports,
            ..Default::default()
        };
        if let Some(source) = table.get_mut(ssrc) {
            sr.rtp_time = source.rtp_time_at(now);
            sr.packet_count = source.packets_sent as u32;
            sr.octet_count = source.octets_sent as u32;
            source.sent_since_report = false;
        }
        out.push_mandatory(Box::new(sr));
    } else {
        out.push_mandatory(Box::new(ReceiverReport {
            ssrc,
            reports,
            ..Default::default()
        }));
    }

    out.push_mandatory(Box::new(local.sdes(ssrc)));

    if let Some(reason) = bye {
        out.push_mandatory(Box::new(Goodbye::new(ssrc, reason)));
        if let Some(source) = table.get_mut(ssrc) {
            source.sent_bye = true;
        }
    }

    if current {
        let remote: Vec<u32> = table
            .pending_remote_byes()
            .into_iter()
            .map(|(ssrc, _)| ssrc)
            .take(COUNT_MAX)
            .collect();
        if !remote.is_empty() {
            out.push_mandatory(Box::new(Goodbye {
                sources: remote.clone(),
                reason: Bytes::from_static(COLLISION_REASON),
            }));
            for ssrc in remote {
                if let Some(source) = table.get_mut(ssrc) {
                    source.sent_bye = true;
                }
            }
        }
    }
}
