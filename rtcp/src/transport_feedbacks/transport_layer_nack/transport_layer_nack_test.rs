use bytes::Bytes;

use super::*;

#[test]
fn test_transport_layer_nack_unmarshal() {
    let tests = vec![
        (
            "valid",
            Bytes::from_static(&[
                0x81, 0xcd, 0x0, 0x3, // v=2, p=0, FMT=1, RTPFB, len=3
                0x90, 0x2f, 0x9e, 0x2e, // sender=0x902f9e2e
                0x90, 0x2f, 0x9e, 0x2e, // media=0x902f9e2e
                0xaa, 0xaa, 0x55, 0x55, // nack 0xAAAA, 0x5555
            ]),
            TransportLayerNack {
                sender_ssrc: 0x902f9e2e,
                media_ssrc: 0x902f9e2e,
                nacks: vec![NackPair {
                    packet_id: 0xaaaa,
                    lost_packets: 0x5555,
                }],
            },
            None,
        ),
        (
            "two entries",
            Bytes::from_static(&[
                0x81, 0xcd, 0x0, 0x4, // v=2, p=0, FMT=1, RTPFB, len=4
                0x00, 0x00, 0x00, 0x01, // sender=0x1
                0x00, 0x00, 0x00, 0x02, // media=0x2
                0x04, 0xd2, 0xff, 0xff, // 1234, all 16 following
                0x04, 0xe3, 0x00, 0x00, // 1251
            ]),
            TransportLayerNack {
                sender_ssrc: 1,
                media_ssrc: 2,
                nacks: vec![
                    NackPair {
                        packet_id: 1234,
                        lost_packets: 0xffff,
                    },
                    NackPair::new(1251),
                ],
            },
            None,
        ),
        (
            "short report",
            Bytes::from_static(&[
                0x81, 0xcd, 0x0, 0x2, // v=2, p=0, FMT=1, RTPFB, len=2
                0x90, 0x2f, 0x9e, 0x2e,
            ]),
            TransportLayerNack::default(),
            Some(Error::PacketTooShort),
        ),
        (
            "transport wide cc",
            Bytes::from_static(&[
                0x8f, 0xcd, 0x0, 0x2, // v=2, p=0, FMT=15, RTPFB, len=2
                0x90, 0x2f, 0x9e, 0x2e, 0x90, 0x2f, 0x9e, 0x2e,
            ]),
            TransportLayerNack::default(),
            Some(Error::WrongType),
        ),
        (
            "empty",
            Bytes::from_static(&[]),
            TransportLayerNack::default(),
            Some(Error::PacketTooShort),
        ),
    ];

    for (name, data, want, want_error) in tests {
        let got = TransportLayerNack::unmarshal(&mut data.clone());

        assert_eq!(
            got.is_err(),
            want_error.is_some(),
            "Unmarshal {name}: err = {got:?}, want {want_error:?}"
        );

        if let Some(err) = want_error {
            let got_err = got.err().unwrap();
            assert_eq!(err, got_err, "Unmarshal {name}: err = {got_err:?}, want {err:?}");
        } else {
            let actual = got.unwrap();
            assert_eq!(actual, want, "Unmarshal {name}");
            assert_eq!(actual.marshal().unwrap(), data, "Marshal {name}");
        }
    }
}

#[test]
fn test_nack_pair_packet_list() {
    let tests = vec![
        ("pid only", NackPair::new(42), vec![42u16]),
        (
            "alternating",
            NackPair {
                packet_id: 42,
                lost_packets: 0b0101,
            },
            vec![42, 43, 45],
        ),
        (
            "last bit",
            NackPair {
                packet_id: 100,
                lost_packets: 0x8000,
            },
            vec![100, 116],
        ),
        (
            "across wrap",
            NackPair {
                packet_id: 65534,
                lost_packets: 0b111,
            },
            vec![65534, 65535, 0, 1],
        ),
    ];

    for (name, pair, want) in tests {
        assert_eq!(pair.packet_list(), want, "{name}");
    }
}

#[test]
fn test_nack_pairs_from_sequence_numbers() {
    let tests = vec![
        ("no sequence numbers", vec![], vec![]),
        ("single", vec![100u16], vec![NackPair::new(100)]),
        ("duplicates", vec![100u16, 100], vec![NackPair::new(100)]),
        (
            "in range",
            vec![100, 101, 105, 115],
            vec![NackPair {
                packet_id: 100,
                lost_packets: 0x4011,
            }],
        ),
        (
            "seventeen apart",
            vec![100, 117, 500, 501, 502],
            vec![
                NackPair::new(100),
                NackPair::new(117),
                NackPair {
                    packet_id: 500,
                    lost_packets: 0x3,
                },
            ],
        ),
        (
            "across wrap",
            vec![65534, 65535, 0, 1, 99],
            vec![
                NackPair {
                    packet_id: 65534,
                    lost_packets: 0b111,
                },
                NackPair::new(99),
            ],
        ),
        (
            "full bitmap then next",
            (1234u16..=1251).collect(),
            vec![
                NackPair {
                    packet_id: 1234,
                    lost_packets: 0xffff,
                },
                NackPair::new(1251),
            ],
        ),
    ];

    for (name, seq_numbers, expected) in tests {
        let actual = nack_pairs_from_sequence_numbers(&seq_numbers);
        assert_eq!(actual, expected, "{name} NackPair generation mismatch");
    }
}

#[test]
fn test_transport_layer_nack_sequence_numbers() {
    let tln = TransportLayerNack {
        sender_ssrc: 1,
        media_ssrc: 2,
        nacks: nack_pairs_from_sequence_numbers(&[10, 12, 40]),
    };
    assert_eq!(tln.sequence_numbers(), vec![10, 12, 40]);
    assert_eq!(tln.marshal_size(), NACK_HEADER_LENGTH + 2 * NACK_PAIR_LENGTH);
    assert_eq!(tln.destination_ssrc(), vec![2]);
}
