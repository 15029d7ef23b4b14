//! Fuzz test for push-channel message decoding
//!
//! Feeds arbitrary bytes to the JSON decoder for [`PushMessage`]. Decoding
//! must never panic, and anything that decodes must survive re-encoding.
//!
//! Run with: cargo +nightly fuzz run push_message_fuzz -- -max_total_time=60

#![no_main]

use libfuzzer_sys::fuzz_target;
use vantage_core::PushMessage;

fuzz_target!(|data: &[u8]| {
    let Ok(message) = serde_json::from_slice::<PushMessage>(data) else {
        return;
    };

    let encoded = serde_json::to_vec(&message).expect("decoded message must re-encode");
    let decoded: PushMessage =
        serde_json::from_slice(&encoded).expect("re-encoded message must decode");
    assert_eq!(decoded.message_type(), message.message_type());

    if let PushMessage::Change(event) = &message {
        // Inserts and updates carry an image unless the sender omitted it;
        // either way the accessor must not panic.
        let _ = event.latest_image();
    }
});
