//! Proxy frame vector tests.

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]

use bytes::Bytes;

use unified_core::protocol::frame::Frame;

use vector_loader::{all, load, Outcome};

#[test]
fn frame_vectors() {
    let files = all();
    assert!(files.len() >= 10, "vector set went missing: {files:?}");

    for f in files {
        let v = load(&f);
        let wire = v.wire_bytes();
        let res = Frame::decode(Bytes::from(wire.clone()));

        match v.outcome {
            Outcome::Error(code) => {
                let e = res.expect_err(&v.name);
                assert_eq!(e.kind().as_str(), code, "vector={}", v.name);
            }
            Outcome::Frame(expected) => {
                let frame = res.unwrap_or_else(|e| panic!("vector {}: {e}", v.name));
                assert_eq!(frame, expected.into_frame(), "vector={}", v.name);
                // canonical encodings re-encode byte for byte
                assert_eq!(frame.encode().unwrap().to_vec(), wire, "vector={}", v.name);
            }
        }
    }
}
