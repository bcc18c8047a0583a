mod session_state;
#[cfg(test)]
mod session_test;

use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use portable_atomic::AtomicBool;
use session_state::SessionState;
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use waitgroup::WaitGroup;

use crate::config::{FnTimeGen, SessionConfig};
use crate::error::{Error, Result};
use crate::event::SessionEvent;
use crate::nack::NackFciBuilder;
use crate::packet_info::RtpPacketInfo;
use crate::source::SourceStats;

/// RtcpWriter sends the RTCP datagrams a session produces.
#[async_trait]
pub trait RtcpWriter {
    /// write sends one compound RTCP packet.
    async fn write(&self, data: &Bytes) -> Result<usize>;
}

pub(crate) struct SessionInternal {
    state: Mutex<SessionState>,
    now: Option<FnTimeGen>,
    start: Instant,
    writer: Arc<dyn RtcpWriter + Send + Sync>,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    wake_tx: mpsc::Sender<()>,
    wake_rx: Mutex<Option<mpsc::Receiver<()>>>,
    close_rx: Mutex<Option<mpsc::Receiver<()>>>,
    failed: AtomicBool,
}

impl SessionInternal {
    fn now(&self) -> Duration {
        if let Some(f) = &self.now {
            f()
        } else {
            self.start.elapsed()
        }
    }

    /// Hands the events raised so far to the application and pokes the timer
    /// task, whose next deadline may have moved.
    fn notify(&self, events: Vec<SessionEvent>) {
        for event in events {
            if self.events_tx.send(event).is_err() {
                log::trace!("session event dropped, nobody listens");
            }
        }
        let _ = self.wake_tx.try_send(());
    }

    async fn write_all(&self, packets: Vec<Bytes>) -> Result<()> {
        for data in packets {
            if let Err(err) = self.writer.write(&data).await {
                self.failed.store(true, Ordering::SeqCst);
                return Err(Error::StateChangeFailure(err.to_string()));
            }
        }
        Ok(())
    }

    /// Runs everything due now and sends the result.
    async fn handle_timeout(&self) -> Result<()> {
        if self.failed.load(Ordering::SeqCst) {
            return Err(Error::ErrClosed);
        }
        let now = self.now();
        let (packets, events) = {
            let mut state = self.state.lock().await;
            let packets = state.on_timer(now);
            (packets, state.take_events())
        };
        for event in events {
            let _ = self.events_tx.send(event);
        }
        self.write_all(packets).await
    }

    /// When the timer task should wake up next, None while no RTCP is planned.
    async fn next_deadline(&self) -> Option<Instant> {
        let next = self.state.lock().await.next_check()?;
        Some(Instant::now() + next.saturating_sub(self.now()))
    }
}

/// Session ties the source table, the feedback queues and the RTCP timer of
/// one RTP session together.
pub struct Session {
    pub(crate) internal: Arc<SessionInternal>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<SessionEvent>>>,

    pub(crate) wg: Mutex<Option<WaitGroup>>,
    pub(crate) close_tx: Mutex<Option<mpsc::Sender<()>>>,
}

impl Session {
    /// new creates a session and starts its timer task. Must be called from
    /// within a tokio runtime.
    pub fn new(config: SessionConfig, writer: Arc<dyn RtcpWriter + Send + Sync>) -> Result<Self> {
        let now_fn = config.now.clone();
        let start = Instant::now();
        let now = now_fn.as_ref().map_or(Duration::ZERO, |f| f());

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (wake_tx, wake_rx) = mpsc::channel(1);
        let (close_tx, close_rx) = mpsc::channel(1);

        let internal = Arc::new(SessionInternal {
            state: Mutex::new(SessionState::new(config, now)),
            now: now_fn,
            start,
            writer,
            events_tx,
            wake_tx,
            wake_rx: Mutex::new(Some(wake_rx)),
            close_rx: Mutex::new(Some(close_rx)),
            failed: AtomicBool::new(false),
        });

        let wg = WaitGroup::new();
        let mut w = Some(wg.worker());
        let internal2 = Arc::clone(&internal);
        tokio::spawn(async move {
            let _d = w.take();
            if let Err(err) = Session::run(internal2).await {
                log::warn!("Session::run got error: {}", err);
            }
        });

        Ok(Session {
            internal,
            events_rx: Mutex::new(Some(events_rx)),
            wg: Mutex::new(Some(wg)),
            close_tx: Mutex::new(Some(close_tx)),
        })
    }

    async fn run(internal: Arc<SessionInternal>) -> Result<()> {
        let mut close_rx = {
            let mut close_rx = internal.close_rx.lock().await;
            if let Some(close) = close_rx.take() {
                close
            } else {
                return Err(Error::ErrInvalidCloseRx);
            }
        };
        let mut wake_rx = {
            let mut wake_rx = internal.wake_rx.lock().await;
            if let Some(wake) = wake_rx.take() {
                wake
            } else {
                return Err(Error::ErrInvalidCloseRx);
            }
        };

        loop {
            let deadline = internal.next_deadline().await;
            let sleep_until = deadline.unwrap_or_else(Instant::now);

            tokio::select! {
                _ = tokio::time::sleep_until(sleep_until), if deadline.is_some() => {
                    internal.handle_timeout().await?;
                }
                _ = wake_rx.recv() => {}
                _ = close_rx.recv() => {
                    return Ok(());
                }
            }
        }
    }

    async fn is_closed(&self) -> bool {
        let close_tx = self.close_tx.lock().await;
        close_tx.is_none()
    }

    pub async fn internal_ssrc(&self) -> u32 {
        self.internal.state.lock().await.internal_ssrc()
    }

    pub async fn source_stats(&self, ssrc: u32) -> Option<SourceStats> {
        self.internal.state.lock().await.source_stats(ssrc)
    }

    /// events returns the receiver of session events. It can be taken once.
    pub async fn events(&self) -> Option<mpsc::UnboundedReceiver<SessionEvent>> {
        self.events_rx.lock().await.take()
    }

    /// set_nack_fci_builder installs an override for building NACK FCIs.
    pub async fn set_nack_fci_builder(&self, builder: Option<Arc<dyn NackFciBuilder>>) {
        self.internal
            .state
            .lock()
            .await
            .set_nack_fci_builder(builder);
    }

    /// process_rtp accounts a received RTP packet and returns the packets that
    /// may be delivered to the application.
    pub async fn process_rtp(&self, pkt: RtpPacketInfo) -> Vec<RtpPacketInfo> {
        let now = self.internal.now();
        let (released, events) = {
            let mut state = self.internal.state.lock().await;
            let released = state.process_rtp(pkt, now);
            (released, state.take_events())
        };
        self.internal.notify(events);
        released
    }

    /// process_rtcp applies a received compound RTCP packet.
    pub async fn process_rtcp(&self, data: &Bytes, from: Option<SocketAddr>) -> Result<()> {
        let now = self.internal.now();
        let (result, events) = {
            let mut state = self.internal.state.lock().await;
            let result = state.process_rtcp(data, from, now);
            (result, state.take_events())
        };
        self.internal.notify(events);
        result
    }

    /// send_rtp accounts a packet we are about to send. It fails when its SSRC
    /// belongs to a remote participant.
    pub async fn send_rtp(&self, pkt: &RtpPacketInfo) -> Result<()> {
        let now = self.internal.now();
        let result = {
            let mut state = self.internal.state.lock().await;
            state.send_rtp(pkt, now)
        };
        self.internal.notify(vec![]);
        result
    }

    /// request_key_unit asks `media_ssrc` for a key unit with a FIR or a PLI.
    pub async fn request_key_unit(&self, media_ssrc: u32, fir: bool) -> bool {
        let now = self.internal.now();
        let queued = {
            let mut state = self.internal.state.lock().await;
            state.request_key_unit(media_ssrc, fir, now)
        };
        self.internal.notify(vec![]);
        queued
    }

    /// request_nack asks for a retransmission of `seqnum` after `delay`, to be
    /// sent within `max_delay` from then.
    pub async fn request_nack(
        &self,
        media_ssrc: u32,
        seqnum: u16,
        delay: Duration,
        max_delay: Duration,
    ) {
        let now = self.internal.now();
        {
            let mut state = self.internal.state.lock().await;
            state.request_nack(media_ssrc, seqnum, delay, max_delay, now);
        }
        self.internal.notify(vec![]);
    }

    /// request_early_rtcp asks for an RTCP within `max_delay`. Returns false
    /// when the next regular report has to do.
    pub async fn request_early_rtcp(&self, max_delay: Duration) -> bool {
        let now = self.internal.now();
        let planned = {
            let mut state = self.internal.state.lock().await;
            state.request_early_rtcp(now, max_delay)
        };
        self.internal.notify(vec![]);
        planned
    }

    /// send_app queues an APP packet for the next RTCP.
    pub async fn send_app(&self, sub_type: u8, name: &str, data: Bytes) -> Result<()> {
        let mut state = self.internal.state.lock().await;
        state.send_app(sub_type, name, data)
    }

    /// schedule_bye makes all our sources leave with `reason`.
    pub async fn schedule_bye(&self, reason: &str) {
        let now = self.internal.now();
        {
            let mut state = self.internal.state.lock().await;
            state.schedule_bye(reason, now);
        }
        self.internal.notify(vec![]);
    }

    /// send_rtcp_now sends an RTCP round immediately, bypassing the pacing.
    pub async fn send_rtcp_now(&self) -> Result<()> {
        if self.is_closed().await {
            return Err(Error::ErrClosed);
        }
        let now = self.internal.now();
        let (packets, events) = {
            let mut state = self.internal.state.lock().await;
            let packets = state.send_rtcp_now(now)?;
            (packets, state.take_events())
        };
        self.internal.notify(events);
        self.internal.write_all(packets).await
    }

    /// handle_timeout runs the timers due at the session clock's current time.
    /// The timer task does this on its own; it is useful with a mocked clock.
    pub async fn handle_timeout(&self) -> Result<()> {
        self.internal.handle_timeout().await
    }

    /// close stops the timer task. Pending feedback is dropped.
    pub async fn close(&self) -> Result<()> {
        {
            let mut close_tx = self.close_tx.lock().await;
            close_tx.take();
        }

        {
            let mut wait_group = self.wg.lock().await;
            if let Some(wg) = wait_group.take() {
                wg.wait().await;
            }
        }

        Ok(())
    }
}
