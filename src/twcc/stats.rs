use std::time::Duration;

use super::TwccPacket;

/// Send-side congestion figures computed from one batch of feedback.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct TwccStats {
    /// Bits per second leaving us, over the departure span of the batch.
    pub bitrate_sent: f64,
    /// Bits per second arriving at the remote, over its arrival span.
    pub bitrate_recv: f64,
    pub packets_sent: usize,
    pub packets_recv: usize,
    /// Lost packets in percent of the packets the feedback described.
    pub packet_loss_pct: f64,
    /// Mean change of one-way delay between consecutive received packets, in
    /// microseconds. Positive values mean queues are building up.
    pub avg_delta_of_delta: i64,
}

impl TwccStats {
    pub(crate) fn from_packets(packets: &[TwccPacket]) -> Self {
        let mut stats = TwccStats::default();
        if packets.is_empty() {
            return stats;
        }

        let sent: Vec<&TwccPacket> = packets.iter().filter(|p| p.local_ts.is_some()).collect();
        let recv: Vec<&TwccPacket> = packets.iter().filter(|p| !p.lost).collect();
        stats.packets_sent = sent.len();
        stats.packets_recv = recv.len();
        stats.packet_loss_pct =
            (packets.len() - recv.len()) as f64 * 100.0 / packets.len() as f64;

        stats.bitrate_sent = bitrate(sent.iter().filter_map(|p| Some((p.local_ts?, p.size))));
        stats.bitrate_recv = bitrate(recv.iter().filter_map(|p| Some((p.remote_ts?, p.size))));

        let mut sum = 0i64;
        let mut count = 0i64;
        let mut prev: Option<(i64, i64)> = None;
        for p in &recv {
            let (local, remote) = match (p.local_ts, p.remote_ts) {
                (Some(l), Some(r)) => (l.as_micros() as i64, r.as_micros() as i64),
                _ => continue,
            };
            if let Some((prev_local, prev_remote)) = prev {
                sum += (remote - prev_remote) - (local - prev_local);
                count += 1;
            }
            prev = Some((local, remote));
        }
        if count > 0 {
            stats.avg_delta_of_delta = sum / count;
        }

        stats
    }
}

/// Bits per second over the span between the first and the last timestamp.
fn bitrate(samples: impl Iterator<Item = (Duration, usize)>) -> f64 {
    let mut first = None;
    let mut last = None;
    let mut bytes = 0usize;
    for (ts, size) in samples {
        first = Some(first.map_or(ts, |f: Duration| f.min(ts)));
        last = Some(last.map_or(ts, |l: Duration| l.max(ts)));
        bytes += size;
    }
    match (first, last) {
        (Some(first), Some(last)) if last > first => {
            bytes as f64 * 8.0 / (last - first).as_secs_f64()
        }
        _ => 0.0,
    }
}
