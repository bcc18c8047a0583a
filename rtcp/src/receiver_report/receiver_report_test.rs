use super::*;

fn sample_report() -> ReceptionReport {
    ReceptionReport {
        ssrc: 0xbc5e9a40,
        fraction_lost: 0x10,
        total_lost: 3,
        last_sequence_number: 0x0001_46e1,
        jitter: 273,
        last_sender_report: 0x9f36432,
        delay: 150137,
    }
}

#[test]
fn test_receiver_report_unmarshal() {
    let tests = vec![
        (
            "one report",
            Bytes::from_static(&[
                0x81u8, 0xc9, 0x0, 0x7, // v=2, p=0, count=1, RR, len=7
                0x90, 0x2f, 0x9e, 0x2e, // ssrc=0x902f9e2e
                0xbc, 0x5e, 0x9a, 0x40, // ssrc=0xbc5e9a40
                0x10, 0x0, 0x0, 0x3, // fracLost=16, totalLost=3
                0x0, 0x1, 0x46, 0xe1, // lastSeq=0x146e1
                0x0, 0x0, 0x1, 0x11, // jitter=273
                0x9, 0xf3, 0x64, 0x32, // lsr=0x9f36432
                0x0, 0x2, 0x4a, 0x79, // delay=150137
            ]),
            ReceiverReport {
                ssrc: 0x902f9e2e,
                reports: vec![sample_report()],
                profile_extensions: Bytes::new(),
            },
            None,
        ),
        (
            "empty with extension",
            Bytes::from_static(&[
                0x80, 0xc9, 0x0, 0x2, // v=2, p=0, count=0, RR, len=2
                0x90, 0x2f, 0x9e, 0x2e, // ssrc=0x902f9e2e
                0x54, 0x45, 0x53, 0x54, // extension
            ]),
            ReceiverReport {
                ssrc: 0x902f9e2e,
                reports: vec![],
                profile_extensions: Bytes::from_static(b"TEST"),
            },
            None,
        ),
        (
            "padded extension",
            Bytes::from_static(&[
                0xa0, 0xc9, 0x0, 0x2, // v=2, p=1, count=0, RR, len=2
                0x90, 0x2f, 0x9e, 0x2e, // ssrc=0x902f9e2e
                0x54, 0x45, 0x00, 0x02, // extension "TE" + padding
            ]),
            ReceiverReport {
                ssrc: 0x902f9e2e,
                reports: vec![],
                profile_extensions: Bytes::from_static(b"TE"),
            },
            None,
        ),
        (
            "report count exceeds length",
            Bytes::from_static(&[
                0x82, 0xc9, 0x0, 0x7, // v=2, p=0, count=2, RR, len=7
                0x90, 0x2f, 0x9e, 0x2e, // ssrc=0x902f9e2e
                0xbc, 0x5e, 0x9a, 0x40, 0x0, 0x0, 0x0, 0x0, 0x0, 0x0, 0x46, 0xe1, 0x0, 0x0, 0x1,
                0x11, 0x9, 0xf3, 0x64, 0x32, 0x0, 0x2, 0x4a, 0x79,
            ]),
            ReceiverReport::default(),
            Some(Error::PacketTooShort),
        ),
        (
            "truncated",
            Bytes::from_static(&[
                0x81, 0xc9, 0x00, 0x07, // v=2, p=0, count=1, RR, len=7
                0x90, 0x2f, 0x9e, 0x2e, // ssrc=0x902f9e2e
                0x00, 0x00, 0x00, 0x00,
            ]),
            ReceiverReport::default(),
            Some(Error::PacketTooShort),
        ),
        (
            "sender report",
            Bytes::from_static(&[
                0x80, 0xc8, 0x0, 0x1, // v=2, p=0, count=0, SR, len=1
                0x90, 0x2f, 0x9e, 0x2e,
            ]),
            ReceiverReport::default(),
            Some(Error::WrongType),
        ),
    ];

    for (name, data, want, want_error) in tests {
        let got = ReceiverReport::unmarshal(&mut data.clone());

        assert_eq!(
            got.is_err(),
            want_error.is_some(),
            "Unmarshal {name}: err = {got:?}, want {want_error:?}"
        );

        if let Some(want_error) = want_error {
            let got_err = got.err().unwrap();
            assert_eq!(
                want_error, got_err,
                "Unmarshal {name}: err = {got_err:?}, want {want_error:?}",
            );
        } else {
            let actual = got.unwrap();
            assert_eq!(actual, want, "Unmarshal {name}");
        }
    }
}

#[test]
fn test_receiver_report_marshal() {
    let tests = vec![
        (
            "one report",
            ReceiverReport {
                ssrc: 0x902f9e2e,
                reports: vec![sample_report()],
                profile_extensions: Bytes::new(),
            },
            None,
        ),
        (
            "padded extension",
            ReceiverReport {
                ssrc: 1,
                reports: vec![],
                profile_extensions: Bytes::from_static(b"abc"),
            },
            None,
        ),
        (
            "too many reports",
            ReceiverReport {
                ssrc: 1,
                reports: vec![sample_report(); COUNT_MAX + 1],
                profile_extensions: Bytes::new(),
            },
            Some(Error::TooManyReports),
        ),
        (
            "total lost overflow",
            ReceiverReport {
                ssrc: 1,
                reports: vec![ReceptionReport {
                    total_lost: 1 << 24,
                    ..Default::default()
                }],
                profile_extensions: Bytes::new(),
            },
            Some(Error::InvalidTotalLost),
        ),
    ];

    for (name, report, want_error) in tests {
        let got = report.marshal();

        assert_eq!(
            got.is_ok(),
            want_error.is_none(),
            "Marshal {name}: err = {got:?}, want {want_error:?}"
        );

        if let Some(err) = want_error {
            let got_err = got.err().unwrap();
            assert_eq!(
                err, got_err,
                "Marshal {name}: err = {got_err:?}, want {err:?}"
            );
        } else {
            let data = got.ok().unwrap();
            assert_eq!(data.len() % 4, 0, "Marshal {name}: unaligned output");
            let decoded = ReceiverReport::unmarshal(&mut data.clone())
                .unwrap_or_else(|_| panic!("Unmarshal {name}"));
            assert_eq!(decoded, report, "{name} round trip mismatch");
        }
    }
}
