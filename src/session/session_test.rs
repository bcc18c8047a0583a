use std::sync::Mutex as SyncMutex;

use rtcp::application_defined::ApplicationDefined;
use rtcp::goodbye::Goodbye;
use rtcp::packet::Packet;
use rtcp::payload_feedbacks::full_intra_request::{FirEntry, FullIntraRequest};
use rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use rtcp::receiver_report::ReceiverReport;
use rtcp::source_description::SourceDescription;
use rtcp::transport_feedbacks::transport_layer_cc::TransportLayerCc;
use rtcp::transport_feedbacks::transport_layer_nack::{NackPair, TransportLayerNack};

use super::*;
use crate::config::SessionConfigBuilder;
use crate::mock::mock_time::MockTime;

const INTERNAL: u32 = 0x12345678;
const REMOTE: u32 = 0x0bad_cafe;

fn peer() -> Option<SocketAddr> {
    "10.0.0.2:5004".parse().ok()
}

fn config(ssrc: u32, probation: u32) -> Result<SessionConfig> {
    SessionConfigBuilder::new()
        .with_internal_ssrc(ssrc)
        .with_cname("user@test")
        .with_probation(probation)
        .build()
}

fn rtp(ssrc: u32, seq: u16) -> RtpPacketInfo {
    RtpPacketInfo {
        ssrc,
        sequence_number: seq,
        timestamp: seq as u32 * 160,
        payload_size: 160,
        clock_rate: 8000,
        address: peer(),
        ..Default::default()
    }
}

/// Remote RTCP: an RR and an SDES from REMOTE, then `rest`.
fn remote_rtcp(rest: Vec<Box<dyn Packet + Send + Sync>>) -> Result<Bytes> {
    let mut packets: Vec<Box<dyn Packet + Send + Sync>> = vec![
        Box::new(ReceiverReport {
            ssrc: REMOTE,
            ..Default::default()
        }),
        Box::new(SourceDescription::with_cname(REMOTE, "remote@test")),
    ];
    packets.extend(rest);
    Ok(rtcp::packet::marshal(&packets)?)
}

fn parse_all(datagrams: &[Bytes]) -> Result<Vec<Box<dyn Packet + Send + Sync>>> {
    let mut out = vec![];
    for data in datagrams {
        let mut data = data.clone();
        out.extend(rtcp::packet::unmarshal(&mut data)?);
    }
    Ok(out)
}

fn downcast<T: 'static + Clone>(packets: &[Box<dyn Packet + Send + Sync>]) -> Vec<T> {
    packets
        .iter()
        .filter_map(|p| p.as_any().downcast_ref::<T>())
        .cloned()
        .collect()
}

/// A session that knows REMOTE as a validated sender.
fn with_remote() -> Result<SessionState> {
    let mut state = SessionState::new(config(INTERNAL, 0)?, Duration::ZERO);
    assert_eq!(state.process_rtp(rtp(REMOTE, 1), Duration::ZERO).len(), 1);
    state.take_events();
    Ok(state)
}

#[test]
fn test_collision_on_internal_ssrc() -> Result<()> {
    let mut state = SessionState::new(config(INTERNAL, 0)?, Duration::ZERO);
    state.send_rtp(
        &RtpPacketInfo {
            address: None,
            ..rtp(INTERNAL, 1)
        },
        Duration::ZERO,
    )?;

    let now = Duration::from_secs(1);
    assert!(state.process_rtp(rtp(INTERNAL, 77), now).is_empty());
    let new_ssrc = state.internal_ssrc();
    assert_ne!(new_ssrc, INTERNAL);
    assert_eq!(
        state.take_events(),
        vec![SessionEvent::SsrcCollision {
            ssrc: INTERNAL,
            new_ssrc
        }]
    );

    // the same participant again is dropped silently
    assert!(state.process_rtp(rtp(INTERNAL, 78), now).is_empty());
    assert!(state.take_events().is_empty());
    assert_eq!(state.internal_ssrc(), new_ssrc);

    let packets = parse_all(&state.send_rtcp_now(Duration::from_secs(2))?)?;
    let byes: Vec<Goodbye> = downcast(&packets);
    assert_eq!(byes.len(), 1);
    assert_eq!(byes[0].sources, vec![INTERNAL]);
    assert!(state.source_stats(INTERNAL).is_none(), "removed after its BYE");
    assert!(state.source_stats(new_ssrc).is_some());

    Ok(())
}

#[test]
fn test_suspicious_bye_for_internal_ssrc() -> Result<()> {
    let mut state = with_remote()?;
    let data = remote_rtcp(vec![Box::new(Goodbye {
        sources: vec![INTERNAL],
        reason: Bytes::from_static(b"spoofed"),
    })])?;

    state.process_rtcp(&data, peer(), Duration::from_secs(1))?;
    assert!(state.take_events().is_empty());
    assert_eq!(state.internal_ssrc(), INTERNAL);
    assert!(state.source_stats(INTERNAL).is_some());

    Ok(())
}

#[test]
fn test_remote_bye() -> Result<()> {
    let mut state = with_remote()?;
    let data = remote_rtcp(vec![Box::new(Goodbye {
        sources: vec![REMOTE],
        reason: Bytes::from_static(b"bye"),
    })])?;

    state.process_rtcp(&data, peer(), Duration::from_secs(1))?;
    assert_eq!(
        state.take_events(),
        vec![SessionEvent::SourceBye {
            ssrc: REMOTE,
            reason: Bytes::from_static(b"bye"),
        }]
    );

    // a repeated BYE is reported once
    state.process_rtcp(&data, peer(), Duration::from_secs(1))?;
    assert!(state.take_events().is_empty());

    Ok(())
}

#[test]
fn test_send_on_remote_ssrc() -> Result<()> {
    let mut state = with_remote()?;
    assert_eq!(
        state.send_rtp(&rtp(REMOTE, 5), Duration::from_secs(1)),
        Err(Error::CollisionDetected(REMOTE))
    );
    Ok(())
}

#[test]
fn test_probation_and_new_source() -> Result<()> {
    let mut state = SessionState::new(config(INTERNAL, 2)?, Duration::ZERO);

    let tests = vec![
        ("first packet held", 100, vec![]),
        ("second releases both", 101, vec![100, 101]),
        ("validated", 102, vec![102]),
    ];
    for (name, seq, want) in tests {
        let got: Vec<u16> = state
            .process_rtp(rtp(REMOTE, seq), Duration::from_millis(seq as u64))
            .iter()
            .map(|p| p.sequence_number)
            .collect();
        assert_eq!(got, want, "{name}");
    }
    assert_eq!(state.take_events(), vec![SessionEvent::NewSource(REMOTE)]);

    let stats = state.source_stats(REMOTE).expect("remote source");
    assert!(stats.validated);
    assert_eq!(stats.packets_received, 3);

    Ok(())
}

#[test]
fn test_receive_feedback() -> Result<()> {
    let mut state = with_remote()?;
    let now = Duration::from_secs(1);

    let fir = |seq: u8| -> Box<dyn Packet + Send + Sync> {
        Box::new(FullIntraRequest {
            sender_ssrc: REMOTE,
            media_ssrc: 0,
            fir: vec![FirEntry {
                ssrc: INTERNAL,
                sequence_number: seq,
            }],
        })
    };
    let data = remote_rtcp(vec![
        Box::new(PictureLossIndication {
            sender_ssrc: REMOTE,
            media_ssrc: INTERNAL,
        }),
        Box::new(PictureLossIndication {
            sender_ssrc: REMOTE,
            media_ssrc: 0xdead,
        }),
        fir(3),
        Box::new(TransportLayerNack {
            sender_ssrc: REMOTE,
            media_ssrc: INTERNAL,
            nacks: vec![NackPair {
                packet_id: 10,
                lost_packets: 0b101,
            }],
        }),
    ])?;
    state.process_rtcp(&data, peer(), now)?;

    let want = vec![
        SessionEvent::ForceKeyUnit {
            ssrc: INTERNAL,
            sender_ssrc: REMOTE,
            fir: false,
        },
        SessionEvent::ForceKeyUnit {
            ssrc: INTERNAL,
            sender_ssrc: REMOTE,
            fir: true,
        },
        SessionEvent::RetransmissionRequest {
            ssrc: INTERNAL,
            sender_ssrc: REMOTE,
            seqnum: 10,
        },
        SessionEvent::RetransmissionRequest {
            ssrc: INTERNAL,
            sender_ssrc: REMOTE,
            seqnum: 11,
        },
        SessionEvent::RetransmissionRequest {
            ssrc: INTERNAL,
            sender_ssrc: REMOTE,
            seqnum: 13,
        },
    ];
    assert_eq!(state.take_events(), want);

    // a repeated FIR sequence number is the same request
    state.process_rtcp(&remote_rtcp(vec![fir(3)])?, peer(), now)?;
    assert!(state.take_events().is_empty());
    state.process_rtcp(&remote_rtcp(vec![fir(4)])?, peer(), now)?;
    assert_eq!(state.take_events().len(), 1);

    let sdes = state.source_stats(REMOTE).expect("remote source").sdes;
    assert_eq!(sdes.get("cname").map(String::as_str), Some("remote@test"));

    Ok(())
}

#[test]
fn test_receive_app() -> Result<()> {
    let mut state = with_remote()?;
    let data = remote_rtcp(vec![Box::new(ApplicationDefined {
        sub_type: 2,
        ssrc: REMOTE,
        name: "TEST".to_owned(),
        data: Bytes::from_static(&[1, 2, 3, 4]),
    })])?;

    state.process_rtcp(&data, peer(), Duration::from_secs(1))?;
    assert_eq!(
        state.take_events(),
        vec![SessionEvent::AppPacket {
            subtype: 2,
            ssrc: REMOTE,
            name: "TEST".to_owned(),
            data: Bytes::from_static(&[1, 2, 3, 4]),
        }]
    );
    Ok(())
}

#[test]
fn test_malformed_rtcp() -> Result<()> {
    let mut state = with_remote()?;
    let tests = vec![
        ("empty", Bytes::new()),
        ("short header", Bytes::from_static(&[0x80, 0xc9])),
        ("truncated body", Bytes::from_static(&[0x81, 0xc9, 0x00, 0x07, 0, 0, 0, 1])),
    ];

    for (name, data) in tests {
        let result = state.process_rtcp(&data, peer(), Duration::from_secs(1));
        assert!(
            matches!(result, Err(Error::MalformedPacket(_))),
            "{name}: {result:?}"
        );
        assert!(state.take_events().is_empty(), "{name}");
    }
    Ok(())
}

#[test]
fn test_send_rtcp_now_before_start() -> Result<()> {
    let mut state = SessionState::new(config(INTERNAL, 0)?, Duration::ZERO);
    assert_eq!(state.next_check(), None);
    assert_eq!(
        state.send_rtcp_now(Duration::ZERO),
        Err(Error::NoRtcpScheduled)
    );
    Ok(())
}

#[test]
fn test_key_unit_requests() -> Result<()> {
    let mut state = with_remote()?;
    let now = Duration::from_secs(1);

    let tests = vec![
        ("unknown source", 0xdead, false, false),
        ("internal source", INTERNAL, true, false),
        ("pli", REMOTE, false, true),
        ("fir", REMOTE, true, true),
    ];
    for (name, ssrc, fir, want) in tests {
        assert_eq!(state.request_key_unit(ssrc, fir, now), want, "{name}");
    }

    let packets = parse_all(&state.send_rtcp_now(now)?)?;
    let firs: Vec<FullIntraRequest> = downcast(&packets);
    assert_eq!(firs.len(), 1);
    assert_eq!(firs[0].sender_ssrc, INTERNAL);
    assert_eq!(firs[0].fir[0].ssrc, REMOTE);
    assert!(
        downcast::<PictureLossIndication>(&packets).is_empty(),
        "the FIR replaced the PLI"
    );

    Ok(())
}

#[test]
fn test_nack_sent_early() -> Result<()> {
    let mut state = with_remote()?;
    let now = Duration::from_secs(1);
    state.send_rtcp_now(now)?;

    let now = now + Duration::from_millis(100);
    state.request_nack(REMOTE, 5, Duration::ZERO, Duration::ZERO, now);
    assert_eq!(state.next_check(), Some(now), "point to point, no dither");

    let packets = parse_all(&state.on_timer(now))?;
    let nacks: Vec<TransportLayerNack> = downcast(&packets);
    assert_eq!(nacks.len(), 1);
    assert_eq!(nacks[0].media_ssrc, REMOTE);
    assert_eq!(nacks[0].sequence_numbers(), vec![5]);

    // nothing left
    assert!(state.on_timer(now).is_empty());
    Ok(())
}

#[test]
fn test_deferred_nack() -> Result<()> {
    let mut state = with_remote()?;
    let now = Duration::from_secs(1);
    state.send_rtcp_now(now)?;

    let delay = Duration::from_millis(20);
    state.request_nack(REMOTE, 7, delay, Duration::ZERO, now);
    assert_eq!(state.next_check(), Some(now + delay));
    assert!(state.on_timer(now + delay / 2).is_empty());

    let packets = parse_all(&state.on_timer(now + delay))?;
    let nacks: Vec<TransportLayerNack> = downcast(&packets);
    assert_eq!(nacks[0].sequence_numbers(), vec![7]);
    Ok(())
}

#[test]
fn test_send_app_and_bye() -> Result<()> {
    let mut state = with_remote()?;
    assert!(state
        .send_app(40, "TEST", Bytes::from_static(&[0; 4]))
        .is_err());
    state.send_app(1, "TEST", Bytes::from_static(&[9; 4]))?;
    state.schedule_bye("leaving", Duration::from_secs(1));

    let packets = parse_all(&state.send_rtcp_now(Duration::from_secs(1))?)?;
    let apps: Vec<ApplicationDefined> = downcast(&packets);
    assert_eq!(apps.len(), 1);
    assert_eq!(apps[0].ssrc, INTERNAL);
    let byes: Vec<Goodbye> = downcast(&packets);
    assert_eq!(byes.len(), 1);
    assert_eq!(byes[0].sources, vec![INTERNAL]);
    assert_eq!(&byes[0].reason[..], b"leaving");

    Ok(())
}

#[test]
fn test_twcc_end_to_end() -> Result<()> {
    const RECEIVER: u32 = 0x0000_0bbb;
    let mut sender = SessionState::new(config(INTERNAL, 0)?, Duration::ZERO);
    let mut receiver = SessionState::new(config(RECEIVER, 0)?, Duration::ZERO);

    for seq in 1..=3u16 {
        let at = Duration::from_millis(10 * seq as u64);
        let pkt = RtpPacketInfo {
            marker: seq == 3,
            payload_type: 96,
            twcc_sequence_number: Some(seq),
            ..rtp(INTERNAL, seq)
        };
        sender.send_rtp(
            &RtpPacketInfo {
                address: None,
                ..pkt.clone()
            },
            at,
        )?;
        receiver.process_rtp(pkt, at + Duration::from_millis(5));
    }

    let datagrams = receiver.send_rtcp_now(Duration::from_millis(40))?;
    let packets = parse_all(&datagrams)?;
    assert_eq!(downcast::<TransportLayerCc>(&packets).len(), 1);

    let from: Option<SocketAddr> = "10.0.0.3:5005".parse().ok();
    for data in &datagrams {
        sender.process_rtcp(data, from, Duration::from_millis(50))?;
    }
    let events = sender.take_events();
    let joined = events
        .iter()
        .find_map(|e| match e {
            SessionEvent::TwccPackets(packets) => Some(packets.clone()),
            _ => None,
        })
        .expect("twcc packets");
    let seqnums: Vec<u16> = joined.iter().map(|p| p.seqnum).collect();
    assert_eq!(seqnums, vec![1, 2, 3]);
    for p in &joined {
        assert!(!p.lost);
        assert_eq!(p.local_ts, Some(Duration::from_millis(10 * p.seqnum as u64)));
        assert_eq!(p.size, 160);
        assert_eq!(p.payload_type, 96);
    }
    assert!(events
        .iter()
        .any(|e| matches!(e, SessionEvent::TwccStats(_))));

    Ok(())
}

#[derive(Default)]
struct MockWriter {
    written: SyncMutex<Vec<Bytes>>,
    fail: bool,
}

#[async_trait]
impl RtcpWriter for MockWriter {
    async fn write(&self, data: &Bytes) -> Result<usize> {
        if self.fail {
            return Err(Error::Other("network is down".to_owned()));
        }
        if let Ok(mut written) = self.written.lock() {
            written.push(data.clone());
        }
        Ok(data.len())
    }
}

fn mocked_config(mt: &Arc<MockTime>, probation: u32) -> Result<SessionConfig> {
    let mt2 = Arc::clone(mt);
    SessionConfigBuilder::new()
        .with_internal_ssrc(INTERNAL)
        .with_cname("user@test")
        .with_probation(probation)
        .with_now_fn(Arc::new(move || mt2.now()))
        .build()
}

#[tokio::test]
async fn test_session_events_and_send() -> Result<()> {
    let mt = Arc::new(MockTime::default());
    let writer = Arc::new(MockWriter::default());
    let session = Session::new(mocked_config(&mt, 1)?, writer.clone())?;
    let mut events = session.events().await.expect("events receiver");
    assert!(session.events().await.is_none(), "taken once");

    assert_eq!(session.send_rtcp_now().await, Err(Error::NoRtcpScheduled));

    mt.advance(Duration::from_millis(20));
    let released = session.process_rtp(rtp(REMOTE, 1)).await;
    assert_eq!(released.len(), 1);
    assert_eq!(events.recv().await, Some(SessionEvent::NewSource(REMOTE)));

    assert!(session.request_key_unit(REMOTE, false).await);
    session.send_rtcp_now().await?;

    let written = writer.written.lock().map(|w| w.clone()).unwrap_or_default();
    assert_eq!(written.len(), 1);
    let packets = parse_all(&written)?;
    assert_eq!(downcast::<PictureLossIndication>(&packets).len(), 1);
    assert_eq!(session.internal_ssrc().await, INTERNAL);

    session.close().await?;
    assert_eq!(session.send_rtcp_now().await, Err(Error::ErrClosed));

    Ok(())
}

#[tokio::test]
async fn test_session_writer_failure() -> Result<()> {
    let mt = Arc::new(MockTime::default());
    let writer = Arc::new(MockWriter {
        fail: true,
        ..Default::default()
    });
    let session = Session::new(mocked_config(&mt, 0)?, writer)?;
    session.process_rtp(rtp(REMOTE, 1)).await;

    let result = session.send_rtcp_now().await;
    assert!(
        matches!(result, Err(Error::StateChangeFailure(_))),
        "{result:?}"
    );
    assert_eq!(session.handle_timeout().await, Err(Error::ErrClosed));

    session.close().await
}

#[tokio::test]
async fn test_session_timer_sends_regular_report() -> Result<()> {
    let mt = Arc::new(MockTime::default());
    let writer = Arc::new(MockWriter::default());
    let session = Session::new(mocked_config(&mt, 0)?, writer.clone())?;
    session.process_rtp(rtp(REMOTE, 1)).await;

    // the first report is due within 1.5 * 2.5s / (e - 1.5)
    mt.advance(Duration::from_secs(4));
    session.handle_timeout().await?;

    let written = writer.written.lock().map(|w| w.clone()).unwrap_or_default();
    assert_eq!(written.len(), 1);
    let rrs: Vec<ReceiverReport> = downcast(&parse_all(&written)?);
    assert_eq!(rrs.len(), 1);
    assert_eq!(rrs[0].reports.len(), 1);
    assert_eq!(rrs[0].reports[0].ssrc, REMOTE);

    session.close().await
}
