
use std::time::Duration;

use crate::config::SessionConfig;
use crate::error::{Error, Result};

/// Size of a fresh session's average RTCP packet, RFC 3550 A.7.
const INITIAL_AVG_RTCP_SIZE: f64 = 100.0;
/// UDP and IPv4 headers, counted into the average packet size.
pub(crate) const UDP_IP_OVERHEAD: usize = 28;
/// Senders get a quarter of the RTCP bandwidth while they are at most a quarter
/// of the members.
const SENDER_BW_FRACTION: f64 = 0.25;
/// e - 3/2, compensates for the timer reconsideration converging below T.
const COMPENSATION: f64 = std::f64::consts::E - 1.5;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum SchedulerState {
    /// Nothing sent or received yet, no timer.
    Idle,
    AwaitingFirstRegular,
    Periodic,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum RtcpKind {
    Regular,
    Early,
}

/// Who takes part in the session, as far as the interval computation cares.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub(crate) struct Membership {
    pub(crate) members: usize,
    pub(crate) senders: usize,
    pub(crate) we_sent: bool,
}

/// RtcpScheduler decides when regular and early RTCP go out.
#[derive(Debug)]
pub(crate) struct RtcpScheduler {
    state: SchedulerState,
    /// Session bandwidth in bits per second.
    bandwidth: f64,
    rtcp_fraction: f64,
    min_interval: Duration,
    feedback_mode: bool,
    avg_rtcp_size: f64,
    /// tp: when the last regular RTCP went out, or the timer started.
    last_regular: Duration,
    /// When any RTCP went out last, and whether it was a regular one.
    last_sent: Option<(Duration, RtcpKind)>,
    /// tn
    next_regular: Option<Duration>,
    next_early: Option<Duration>,
    first: bool,
}

impl RtcpScheduler {
    pub(crate) fn new(config: &SessionConfig) -> Self {
        RtcpScheduler {
            state: SchedulerState::Idle,
            bandwidth: config.bandwidth,
            rtcp_fraction: config.rtcp_fraction,
            min_interval: config.min_interval,
            feedback_mode: config.feedback_mode,
            avg_rtcp_size: INITIAL_AVG_RTCP_SIZE,
            last_regular: Duration::ZERO,
            last_sent: None,
            next_regular: None,
            next_early: None,
            first: true,
        }
    }

    pub(crate) fn state(&self) -> SchedulerState {
        self.state
    }

    /// Starts the timer on the first packet sent or received.
    pub(crate) fn start(&mut self, now: Duration, m: Membership) {
        if self.state != SchedulerState::Idle {
            return;
        }
        self.state = SchedulerState::AwaitingFirstRegular;
        self.last_regular = now;
        self.next_regular = Some(now + self.calculate_interval(m));
        log::trace!("rtcp timer started, first report at {:?}", self.next_regular);
    }

    /// deterministic_interval is Td of RFC 3550 A.7, before randomization.
    pub(crate) fn deterministic_interval(&self, m: Membership) -> Duration {
        let mut rtcp_bw = self.bandwidth / 8.0 * self.rtcp_fraction;
        let mut n = m.members.max(1) as f64;
        if (m.senders as f64) <= m.members as f64 * SENDER_BW_FRACTION {
            if m.we_sent {
                rtcp_bw *= SENDER_BW_FRACTION;
                n = m.senders as f64;
            } else {
                rtcp_bw *= 1.0 - SENDER_BW_FRACTION;
                n = m.members.saturating_sub(m.senders).max(1) as f64;
            }
        }

        let min_interval = if self.first {
            self.min_interval / 2
        } else {
            self.min_interval
        };
        let t = Duration::from_secs_f64(self.avg_rtcp_size * n / rtcp_bw);
        t.max(min_interval)
    }

    fn calculate_interval(&self, m: Membership) -> Duration {
        let td = self.deterministic_interval(m);
        td.mul_f64(rand::random_range(0.5..1.5) / COMPENSATION)
    }

    /// T_rr, the current regular interval.
    fn regular_interval(&self) -> Duration {
        self.next_regular
            .map_or(Duration::ZERO, |tn| tn.saturating_sub(self.last_regular))
    }

    /// When the timer task should look again, None while idle.
    pub(crate) fn next_check(&self) -> Option<Duration> {
        match (self.next_early, self.next_regular) {
            (Some(early), Some(regular)) => Some(early.min(regular)),
            (early, regular) => early.or(regular),
        }
    }

    /// poll says which RTCP is due at `now`. A regular report whose time came
    /// is reconsidered against the current membership first.
    pub(crate) fn poll(&mut self, now: Duration, m: Membership) -> Option<RtcpKind> {
        if self.next_early.map_or(false, |early| early <= now) {
            return Some(RtcpKind::Early);
        }

        let tn = self.next_regular?;
        if tn > now {
            return None;
        }
        let reconsidered = self.last_regular + self.calculate_interval(m);
        if reconsidered <= now {
            Some(RtcpKind::Regular)
        } else {
            log::trace!("rtcp reconsidered, moved to {reconsidered:?}");
            self.next_regular = Some(reconsidered);
            None
        }
    }

    /// on_sent accounts an emitted RTCP round of `size` bytes and plans the
    /// next one.
    pub(crate) fn on_sent(&mut self, now: Duration, kind: RtcpKind, size: usize, m: Membership) {
        let size = (size + UDP_IP_OVERHEAD) as f64;
        self.avg_rtcp_size = size / 16.0 + self.avg_rtcp_size * 15.0 / 16.0;
        self.last_sent = Some((now, kind));
        self.next_early = None;

        if kind == RtcpKind::Regular {
            self.first = false;
            self.state = SchedulerState::Periodic;
            self.last_regular = now;
            let mut interval = self.calculate_interval(m);
            if self.feedback_mode {
                let floor = self.min_interval.mul_f64(rand::random_range(0.5..1.5));
                interval = interval.max(floor);
            }
            self.next_regular = Some(now + interval);
        }
    }

    /// request_early asks for an early RTCP within `max_delay`, RFC 4585
    /// 3.5.2. Returns true when an early packet is planned; otherwise the
    /// feedback waits for the next regular report.
    pub(crate) fn request_early(
        &mut self,
        now: Duration,
        max_delay: Duration,
        m: Membership,
    ) -> bool {
        if self.state != SchedulerState::Periodic {
            return false;
        }
        if self.next_early.is_some() {
            return true;
        }
        let tn = match self.next_regular {
            Some(tn) => tn,
            None => return false,
        };
        if now + max_delay >= tn {
            log::trace!("early rtcp not needed, regular report is in time");
            return false;
        }

        let dither_max = if m.members <= 2 {
            Duration::ZERO
        } else {
            self.regular_interval() / 2
        };
        if now + dither_max > tn {
            return false;
        }

        let allow_early = match self.last_sent {
            Some((_, RtcpKind::Regular)) | None => true,
            Some((at, RtcpKind::Early)) => now.saturating_sub(at) >= self.regular_interval(),
        };
        if !allow_early {
            log::debug!("early rtcp refused, one went out less than T_rr ago");
            return false;
        }

        self.next_early = Some(now + dither_max.mul_f64(rand::random::<f64>()));
        true
    }

    /// force allows an immediate RTCP. It fails while no timer was computed.
    pub(crate) fn force(&self) -> Result<()> {
        if self.next_regular.is_none() {
            return Err(Error::NoRtcpScheduled);
        }
        Ok(())
    }

    /// Plans the BYE round: the average size restarts and the interval is the
    /// one of a first report.
    pub(crate) fn schedule_bye(&mut self, now: Duration, m: Membership) {
        if self.state == SchedulerState::Idle {
            self.state = SchedulerState::AwaitingFirstRegular;
        }
        self.avg_rtcp_size = INITIAL_AVG_RTCP_SIZE;
        self.first = true;
        self.last_regular = now;
        self.next_regular = Some(now + self.calculate_interval(m));
    }
}
