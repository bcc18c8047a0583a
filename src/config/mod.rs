
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use rtcp::source_description::{SdesType, SourceDescriptionItem};

use crate::error::{Error, Result};

/// Clock the session reads its running time from.
pub type FnTimeGen = Arc<dyn Fn() -> Duration + Sync + 'static + Send>;

pub(crate) const DEFAULT_MTU: usize = 1400;
pub(crate) const DEFAULT_BANDWIDTH: f64 = 64000.0;
pub(crate) const DEFAULT_RTCP_FRACTION: f64 = 0.05;
pub(crate) const DEFAULT_MIN_INTERVAL: Duration = Duration::from_secs(5);
pub(crate) const DEFAULT_PROBATION: u32 = 2;
/// Smallest MTU that still holds an RR, an SDES and one feedback message.
const MIN_MTU: usize = 128;

/// SessionConfig holds everything a session needs besides its transport.
#[derive(Clone)]
pub struct SessionConfig {
    pub internal_ssrc: u32,
    pub cname: String,
    /// Extra SDES items sent next to the CNAME, PRIV included.
    pub sdes_items: Vec<SourceDescriptionItem>,
    pub mtu: usize,
    /// Session bandwidth in bits per second.
    pub bandwidth: f64,
    /// Share of the bandwidth RTCP may use.
    pub rtcp_fraction: f64,
    pub min_interval: Duration,
    /// Consecutive packets a new source must send before it is accepted.
    pub probation: u32,
    /// Let a remote SSRC seen from a new address take over the old mapping.
    pub favor_new: bool,
    /// Inactivity after which a source is gone. Computed from the report
    /// interval when unset.
    pub receiver_timeout: Option<Duration>,
    /// Finalize TWCC feedback after this long even without a marker bit.
    pub twcc_feedback_interval: Option<Duration>,
    /// RTP/AVPF: early RTCP and the randomized minimum after regular reports.
    pub feedback_mode: bool,
    pub now: Option<FnTimeGen>,
}

impl std::fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionConfig")
            .field("internal_ssrc", &self.internal_ssrc)
            .field("cname", &self.cname)
            .field("sdes_items", &self.sdes_items)
            .field("mtu", &self.mtu)
            .field("bandwidth", &self.bandwidth)
            .field("rtcp_fraction", &self.rtcp_fraction)
            .field("min_interval", &self.min_interval)
            .field("probation", &self.probation)
            .field("favor_new", &self.favor_new)
            .field("receiver_timeout", &self.receiver_timeout)
            .field("twcc_feedback_interval", &self.twcc_feedback_interval)
            .field("feedback_mode", &self.feedback_mode)
            .finish()
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        let internal_ssrc = rand::random::<u32>();
        SessionConfig {
            internal_ssrc,
            cname: default_cname(internal_ssrc),
            sdes_items: vec![],
            mtu: DEFAULT_MTU,
            bandwidth: DEFAULT_BANDWIDTH,
            rtcp_fraction: DEFAULT_RTCP_FRACTION,
            min_interval: DEFAULT_MIN_INTERVAL,
            probation: DEFAULT_PROBATION,
            favor_new: false,
            receiver_timeout: None,
            twcc_feedback_interval: None,
            feedback_mode: true,
            now: None,
        }
    }
}

fn default_cname(ssrc: u32) -> String {
    format!("user{ssrc}@host")
}

/// SessionConfigBuilder can be used to configure a Session
#[derive(Default)]
pub struct SessionConfigBuilder {
    internal_ssrc: Option<u32>,
    cname: Option<String>,
    sdes_items: Vec<(SdesType, Bytes)>,
    sdes_private: Vec<(Bytes, Bytes)>,
    mtu: Option<usize>,
    bandwidth: Option<f64>,
    rtcp_fraction: Option<f64>,
    min_interval: Option<Duration>,
    probation: Option<u32>,
    favor_new: bool,
    receiver_timeout: Option<Duration>,
    twcc_feedback_interval: Option<Duration>,
    feedback_mode: Option<bool>,
    now: Option<FnTimeGen>,
}

impl SessionConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// with_internal_ssrc sets the SSRC we send with.
    pub fn with_internal_ssrc(mut self, ssrc: u32) -> Self {
        self.internal_ssrc = Some(ssrc);
        self
    }

    pub fn with_cname(mut self, cname: impl Into<String>) -> Self {
        self.cname = Some(cname.into());
        self
    }

    /// with_sdes_item adds a NAME, EMAIL, TOOL or similar item to our SDES.
    pub fn with_sdes_item(mut self, sdes_type: SdesType, text: impl Into<Bytes>) -> Self {
        self.sdes_items.push((sdes_type, text.into()));
        self
    }

    /// with_sdes_private adds a PRIV item made of `prefix` and `value`.
    pub fn with_sdes_private(mut self, prefix: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        self.sdes_private.push((prefix.into(), value.into()));
        self
    }

    pub fn with_mtu(mut self, mtu: usize) -> Self {
        self.mtu = Some(mtu);
        self
    }

    /// with_bandwidth sets the session bandwidth in bits per second.
    pub fn with_bandwidth(mut self, bandwidth: f64) -> Self {
        self.bandwidth = Some(bandwidth);
        self
    }

    pub fn with_rtcp_fraction(mut self, fraction: f64) -> Self {
        self.rtcp_fraction = Some(fraction);
        self
    }

    /// with_min_interval sets the minimum regular RTCP interval.
    pub fn with_min_interval(mut self, interval: Duration) -> Self {
        self.min_interval = Some(interval);
        self
    }

    /// with_probation sets how many consecutive packets validate a new source.
    /// 0 disables probation.
    pub fn with_probation(mut self, probation: u32) -> Self {
        self.probation = Some(probation);
        self
    }

    pub fn with_favor_new(mut self, favor_new: bool) -> Self {
        self.favor_new = favor_new;
        self
    }

    pub fn with_receiver_timeout(mut self, timeout: Duration) -> Self {
        self.receiver_timeout = Some(timeout);
        self
    }

    pub fn with_twcc_feedback_interval(mut self, interval: Duration) -> Self {
        self.twcc_feedback_interval = Some(interval);
        self
    }

    pub fn with_feedback_mode(mut self, feedback_mode: bool) -> Self {
        self.feedback_mode = Some(feedback_mode);
        self
    }

    /// with_now_fn sets an alternative for the session clock.
    pub fn with_now_fn(mut self, now: FnTimeGen) -> Self {
        self.now = Some(now);
        self
    }

    pub fn build(self) -> Result<SessionConfig> {
        let internal_ssrc = self.internal_ssrc.unwrap_or_else(rand::random::<u32>);
        let mtu = self.mtu.unwrap_or(DEFAULT_MTU);
        if mtu < MIN_MTU {
            return Err(Error::ErrInvalidConfig(format!(
                "mtu {mtu} is below {MIN_MTU}"
            )));
        }

        let rtcp_fraction = self.rtcp_fraction.unwrap_or(DEFAULT_RTCP_FRACTION);
        if !(rtcp_fraction > 0.0 && rtcp_fraction <= 1.0) {
            return Err(Error::ErrInvalidConfig(format!(
                "rtcp fraction {rtcp_fraction} out of (0, 1]"
            )));
        }

        let bandwidth = self.bandwidth.unwrap_or(DEFAULT_BANDWIDTH);
        if bandwidth <= 0.0 {
            return Err(Error::ErrInvalidConfig(format!(
                "bandwidth {bandwidth} must be positive"
            )));
        }

        let cname = self.cname.unwrap_or_else(|| default_cname(internal_ssrc));
        if cname.is_empty() || cname.len() > rtcp::header::SDES_MAX_OCTET_COUNT {
            return Err(Error::ErrInvalidConfig("cname length".to_owned()));
        }

        let mut sdes_items = vec![];
        for (sdes_type, text) in self.sdes_items {
            if matches!(
                sdes_type,
                SdesType::SdesEnd | SdesType::SdesCname | SdesType::SdesPrivate
            ) {
                return Err(Error::ErrInvalidConfig(format!(
                    "{sdes_type} is not a free SDES item"
                )));
            }
            sdes_items.push(SourceDescriptionItem::new(sdes_type, text));
        }
        for (prefix, value) in self.sdes_private {
            sdes_items.push(SourceDescriptionItem::private(&prefix, &value)?);
        }

        Ok(SessionConfig {
            internal_ssrc,
            cname,
            sdes_items,
            mtu,
            bandwidth,
            rtcp_fraction,
            min_interval: self.min_interval.unwrap_or(DEFAULT_MIN_INTERVAL),
            probation: self.probation.unwrap_or(DEFAULT_PROBATION),
            favor_new: self.favor_new,
            receiver_timeout: self.receiver_timeout,
            twcc_feedback_interval: self.twcc_feedback_interval,
            feedback_mode: self.feedback_mode.unwrap_or(true),
            now: self.now,
        })
    }
}
