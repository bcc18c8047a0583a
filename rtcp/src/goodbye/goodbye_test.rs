use super::*;

#[test]
fn test_goodbye_unmarshal() {
    let tests = vec![
        (
            "with reason",
            Bytes::from_static(&[
                0x81, 0xcb, 0x00, 0x02, // v=2, p=0, count=1, BYE, len=2
                0x90, 0x2f, 0x9e, 0x2e, // ssrc=0x902f9e2e
                0x03, 0x46, 0x4f, 0x4f, // len=3, text=FOO
            ]),
            Goodbye {
                sources: vec![0x902f9e2e],
                reason: Bytes::from_static(b"FOO"),
            },
            None,
        ),
        (
            "truncated reason",
            Bytes::from_static(&[
                0x81, 0xcb, 0x00, 0x03, // v=2, p=0, count=1, BYE, len=3
                0x90, 0x2f, 0x9e, 0x2e, // ssrc=0x902f9e2e
                0x0d, 0x53, 0x53, 0x52, 0x43, 0x20, 0x43, 0x6f, // len=13, "SSRC Co"
            ]),
            Goodbye::default(),
            Some(Error::PacketTooShort),
        ),
        (
            "two sources",
            Bytes::from_static(&[
                0x82, 0xcb, 0x00, 0x02, // v=2, p=0, count=2, BYE, len=2
                0x00, 0x00, 0x00, 0x01, // ssrc=1
                0x00, 0x00, 0x00, 0x02, // ssrc=2
            ]),
            Goodbye {
                sources: vec![1, 2],
                reason: Bytes::new(),
            },
            None,
        ),
        (
            "octet count exceeds packet",
            Bytes::from_static(&[
                0x81, 0xcb, 0x00, 0x02, // v=2, p=0, count=1, BYE, len=2
                0x90, 0x2f, 0x9e, 0x2e, // ssrc=0x902f9e2e
                0x04, 0x46, 0x4f, 0x4f, // len=4, text=FOO
            ]),
            Goodbye::default(),
            Some(Error::PacketTooShort),
        ),
        (
            "source count exceeds packet",
            Bytes::from_static(&[
                0x82, 0xcb, 0x00, 0x01, // v=2, p=0, count=2, BYE, len=1
                0x90, 0x2f, 0x9e, 0x2e, // ssrc=0x902f9e2e
            ]),
            Goodbye::default(),
            Some(Error::PacketTooShort),
        ),
        (
            "wrong type",
            Bytes::from_static(&[
                0x81, 0xca, 0x00, 0x02, // v=2, p=0, count=1, SDES, len=2
                0x90, 0x2f, 0x9e, 0x2e, // ssrc=0x902f9e2e
                0x03, 0x46, 0x4f, 0x4f, // len=3, text=FOO
            ]),
            Goodbye::default(),
            Some(Error::WrongType),
        ),
    ];

    for (name, data, want, want_error) in tests {
        let got = Goodbye::unmarshal(&mut data.clone());

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
            assert_eq!(actual.marshal().unwrap(), data, "Marshal {name}");
        }
    }
}

#[test]
fn test_goodbye_marshal() {
    let tests = vec![
        (
            "collision reason",
            Goodbye::new(0x1234, Bytes::from_static(b"SSRC Collision")),
            None,
        ),
        (
            "no sources",
            Goodbye {
                sources: vec![],
                reason: Bytes::new(),
            },
            None,
        ),
        (
            "too many sources",
            Goodbye {
                sources: (0..32).collect(),
                reason: Bytes::new(),
            },
            Some(Error::TooManySources),
        ),
        (
            "reason too long",
            Goodbye {
                sources: vec![1],
                reason: Bytes::from(vec![b'x'; 256]),
            },
            Some(Error::ReasonTooLong),
        ),
    ];

    for (name, bye, want_error) in tests {
        let got = bye.marshal();

        assert_eq!(
            got.is_ok(),
            want_error.is_none(),
            "Marshal {name}: err = {got:?}, want {want_error:?}"
        );

        if let Some(err) = want_error {
            let got_err = got.err().unwrap();
            assert_eq!(err, got_err, "Marshal {name}");
        } else {
            let data = got.ok().unwrap();
            assert_eq!(data.len() % 4, 0, "Marshal {name}: unaligned");
            let decoded = Goodbye::unmarshal(&mut data.clone())
                .unwrap_or_else(|_| panic!("Unmarshal {name}"));
            assert_eq!(decoded, bye, "{name} round trip mismatch");
        }
    }
}
