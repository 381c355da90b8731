// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Property tests for frame/serde roundtrips.

use proptest::prelude::*;

use crate::wire::{decode, encode};
use crate::{Request, Response};
use muster_core::Essence;

fn arb_essence() -> impl Strategy<Value = Essence> {
    (
        "[ -~]{1,40}",
        proptest::option::of("[ -~]{1,20}"),
        proptest::option::of(any::<bool>()),
    )
        .prop_map(|(cmd, cwd, mounts)| {
            let mut essence = Essence::new(cmd);
            if let Some(cwd) = cwd {
                essence = essence.with_cwd(cwd);
            }
            if let Some(readonly) = mounts {
                essence =
                    essence.with_mounts(serde_json::json!([{"Mount": "/data", "ro": readonly}]));
            }
            essence
        })
}

fn arb_request() -> impl Strategy<Value = Request> {
    prop_oneof![
        proptest::collection::vec(arb_essence(), 0..4)
            .prop_map(|essences| Request::Kill { essences }),
        Just(Request::KillAll),
        "[a-z0-9_-]{1,16}".prop_map(|identifier| Request::KillGroup { identifier }),
    ]
}

fn arb_response() -> impl Strategy<Value = Response> {
    prop_oneof![
        (any::<u8>(), any::<u8>(), proptest::option::of("[ -~]{0,40}")).prop_map(
            |(eligible, killed, first_error)| Response::Killed {
                eligible: eligible as usize,
                killed: killed as usize,
                first_error,
            }
        ),
        "[ -~]{0,60}".prop_map(|message| Response::Error { message }),
    ]
}

proptest! {
    #[test]
    fn any_request_roundtrips(request in arb_request()) {
        let frame = encode(&request).unwrap();
        let decoded: Request = decode(&frame).unwrap();
        prop_assert_eq!(decoded, request);
    }

    #[test]
    fn any_response_roundtrips(response in arb_response()) {
        let frame = encode(&response).unwrap();
        let decoded: Response = decode(&frame).unwrap();
        prop_assert_eq!(decoded, response);
    }

    #[test]
    fn decode_never_panics_on_arbitrary_bytes(bytes in proptest::collection::vec(any::<u8>(), 0..64)) {
        let _ = decode::<Request>(&bytes);
    }
}
