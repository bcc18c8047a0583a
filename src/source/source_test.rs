use super::*;

fn rtp(seq: u16) -> RtpPacketInfo {
    RtpPacketInfo {
        ssrc: 0x1234,
        sequence_number: seq,
        payload_size: 100,
        ..Default::default()
    }
}

#[test]
fn test_source_probation() {
    let tests = vec![
        ("disabled", 0, vec![10u16, 11, 12], vec![1usize, 1, 1]),
        ("two in a row", 2, vec![10, 11, 12], vec![0, 2, 1]),
        ("gap restarts", 2, vec![10, 20, 21, 22], vec![0, 0, 2, 1]),
        ("longer gate", 3, vec![5, 6, 8, 9, 10], vec![0, 0, 0, 0, 3]),
        ("across wrap", 2, vec![65535, 0, 1], vec![0, 2, 1]),
        ("duplicate first", 2, vec![7, 7, 8], vec![0, 0, 2]),
    ];

    for (name, probation, seqs, want) in tests {
        let mut source = Source::new(0x1234, probation, Duration::ZERO);
        let mut got = vec![];
        let mut released = vec![];
        for (i, seq) in seqs.into_iter().enumerate() {
            let out = source.process_rtp(rtp(seq), Duration::from_millis(i as u64 * 20));
            got.push(out.len());
            released.extend(out.into_iter().map(|p| p.sequence_number));
        }
        assert_eq!(got, want, "{name}");
        assert!(source.validated, "{name}: not validated");

        let mut sorted = released.clone();
        sorted.sort_by_key(|s| s.wrapping_sub(released[0]));
        assert_eq!(released, sorted, "{name}: released out of order");
    }
}

#[test]
fn test_source_report_loss() {
    let mut source = Source::new(0x1234, 0, Duration::ZERO);
    for seq in [1u16, 2, 3, 5] {
        assert_eq!(source.process_rtp(rtp(seq), Duration::ZERO).len(), 1);
    }

    let rr = source.generate_report(Duration::from_secs(1));
    assert_eq!(rr.ssrc, 0x1234);
    assert_eq!(rr.last_sequence_number, 5);
    assert_eq!(rr.total_lost, 1);
    // 1 of 5 lost
    assert_eq!(rr.fraction_lost, 51);

    // nothing new, nothing lost this interval
    let rr = source.generate_report(Duration::from_secs(2));
    assert_eq!(rr.total_lost, 1);
    assert_eq!(rr.fraction_lost, 0);
    assert_eq!(source.stats().packets_received, 4);
}

#[test]
fn test_source_report_wrap() {
    let mut source = Source::new(0x1234, 0, Duration::ZERO);
    for seq in [65534u16, 65535, 0, 1] {
        source.process_rtp(rtp(seq), Duration::ZERO);
    }

    let rr = source.generate_report(Duration::from_secs(1));
    assert_eq!(rr.last_sequence_number, (1 << 16) | 1);
    assert_eq!(rr.total_lost, 0);
}

#[test]
fn test_source_large_jump_needs_two_packets() {
    let mut source = Source::new(0x1234, 0, Duration::ZERO);
    assert_eq!(source.process_rtp(rtp(100), Duration::ZERO).len(), 1);
    assert!(source.process_rtp(rtp(20000), Duration::ZERO).is_empty());
    // a second packet right after the jump means the sender restarted
    assert_eq!(source.process_rtp(rtp(20001), Duration::ZERO).len(), 1);
    assert_eq!(source.extended_max_seq(), 20001);
}

#[test]
fn test_source_jitter() {
    let mut source = Source::new(0x1234, 0, Duration::ZERO);
    let mut first = rtp(1);
    first.clock_rate = 90000;
    first.timestamp = 0;
    source.process_rtp(first, Duration::ZERO);

    // 20ms later but only 10ms of media: 900 units of transit change
    let mut second = rtp(2);
    second.clock_rate = 90000;
    second.timestamp = 900;
    source.process_rtp(second, Duration::from_millis(20));

    assert_eq!(source.stats().jitter, 56);
}

#[test]
fn test_source_last_sender_report() {
    let mut source = Source::new(0x1234, 0, Duration::ZERO);
    source.process_rtp(rtp(1), Duration::ZERO);
    source.process_sender_report(
        &SenderReport {
            ssrc: 0x1234,
            ntp_time: 0x1122334455667788,
            ..Default::default()
        },
        Duration::from_secs(3),
    );

    let rr = source.generate_report(Duration::from_secs(4));
    assert_eq!(rr.last_sender_report, 0x33445566);
    assert_eq!(rr.delay, 65536);
}

#[test]
fn test_source_report_block_round_trip() {
    let mut source = Source::new(0x1234, 0, Duration::ZERO);
    // we are at 0x0001_8000 in 16.16, the block says we sent our SR at
    // 0x0001_0000 and it was held for 0x4000
    let ntp_now = 0x0000_0001_8000_0000u64;
    source.process_report_block(
        &ReceptionReport {
            ssrc: 0x5678,
            last_sender_report: 0x0001_0000,
            delay: 0x4000,
            ..Default::default()
        },
        ntp_now,
    );

    let stats = source.stats();
    assert!(stats.have_rb);
    assert_eq!(stats.rb_ssrc, 0x5678);
    assert_eq!(stats.round_trip_time, Some(Duration::from_millis(250)));
}

#[test]
fn test_sdes_key() {
    let tests = vec![
        (
            "cname",
            SourceDescriptionItem::new(SdesType::SdesCname, "a@b"),
            Some(("cname".to_owned(), "a@b".to_owned())),
        ),
        (
            "location",
            SourceDescriptionItem::new(SdesType::SdesLocation, "here"),
            Some(("loc".to_owned(), "here".to_owned())),
        ),
        (
            "private",
            SourceDescriptionItem {
                sdes_type: SdesType::SdesPrivate,
                text: Bytes::from_static(b"\x03abcxyz"),
            },
            Some(("priv:abc".to_owned(), "xyz".to_owned())),
        ),
        (
            "private with bad prefix",
            SourceDescriptionItem {
                sdes_type: SdesType::SdesPrivate,
                text: Bytes::from_static(b"\x09abc"),
            },
            None,
        ),
    ];

    for (name, item, want) in tests {
        assert_eq!(sdes_key(&item), want, "{name}");
    }
}

#[test]
fn test_unix2ntp() {
    let st = UNIX_EPOCH + Duration::from_millis(1500);
    let ntp = unix2ntp(st);
    assert_eq!(ntp >> 32, 0x83AA7E80 + 1);
    assert_eq!(ntp & 0xFFFFFFFF, 0x80000000);
}
