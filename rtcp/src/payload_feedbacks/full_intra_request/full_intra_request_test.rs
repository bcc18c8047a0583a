use bytes::Bytes;

use super::*;

#[test]
fn test_full_intra_request_unmarshal() {
    let tests = vec![
        (
            "single target",
            Bytes::from_static(&[
                0x84, 0xce, 0x00, 0x04, // v=2, p=0, FMT=4, PSFB, len=4
                0x00, 0x00, 0x00, 0x01, // sender=0x1
                0x00, 0x00, 0x00, 0x00, // media=0x0
                0x12, 0x34, 0x56, 0x78, // ssrc=0x12345678
                0x42, 0x00, 0x00, 0x00, // seqnr=0x42
            ]),
            FullIntraRequest {
                sender_ssrc: 0x1,
                media_ssrc: 0x0,
                fir: vec![FirEntry {
                    ssrc: 0x12345678,
                    sequence_number: 0x42,
                }],
            },
            None,
        ),
        (
            "two targets",
            Bytes::from_static(&[
                0x84, 0xce, 0x00, 0x06, // v=2, p=0, FMT=4, PSFB, len=6
                0x00, 0x00, 0x00, 0x01, // sender=0x1
                0x00, 0x00, 0x00, 0x00, // media=0x0
                0x12, 0x34, 0x56, 0x78, // ssrc=0x12345678
                0x42, 0x00, 0x00, 0x00, // seqnr=0x42
                0x98, 0x76, 0x54, 0x32, // ssrc=0x98765432
                0xff, 0x00, 0x00, 0x00, // seqnr=0xff
            ]),
            FullIntraRequest {
                sender_ssrc: 0x1,
                media_ssrc: 0x0,
                fir: vec![
                    FirEntry {
                        ssrc: 0x12345678,
                        sequence_number: 0x42,
                    },
                    FirEntry {
                        ssrc: 0x98765432,
                        sequence_number: 0xff,
                    },
                ],
            },
            None,
        ),
        (
            "no fci",
            Bytes::from_static(&[
                0x84, 0xce, 0x00, 0x02, // v=2, p=0, FMT=4, PSFB, len=2
                0x00, 0x00, 0x00, 0x01, // sender=0x1
                0x00, 0x00, 0x00, 0x00, // media=0x0
            ]),
            FullIntraRequest {
                sender_ssrc: 0x1,
                media_ssrc: 0x0,
                fir: vec![],
            },
            None,
        ),
        (
            "packet too short",
            Bytes::from_static(&[0x00, 0x00, 0x00, 0x00]),
            FullIntraRequest::default(),
            Some(Error::PacketTooShort),
        ),
        (
            "picture loss indication",
            Bytes::from_static(&[
                0x81, 0xce, 0x00, 0x02, // v=2, p=0, FMT=1, PSFB, len=2
                0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00,
            ]),
            FullIntraRequest::default(),
            Some(Error::WrongType),
        ),
    ];

    for (name, data, want, want_error) in tests {
        let got = FullIntraRequest::unmarshal(&mut data.clone());

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
fn test_full_intra_request_destination_ssrc() {
    let fir = FullIntraRequest {
        sender_ssrc: 1,
        media_ssrc: 0,
        fir: vec![
            FirEntry {
                ssrc: 5,
                sequence_number: 0,
            },
            FirEntry {
                ssrc: 6,
                sequence_number: 1,
            },
        ],
    };
    assert_eq!(fir.destination_ssrc(), vec![5, 6]);
    assert_eq!(fir.marshal_size(), 28);
}
