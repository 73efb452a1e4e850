#![no_main]

use channel_point_sounds::protocol::{ChannelPointsMessage, ServerFrame};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let _ = serde_json::from_slice::<ServerFrame>(data);

    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };

    // Inbound frames and the nested channel points document both come from
    // the network.
    if let Ok(ServerFrame::Message { data }) = ServerFrame::parse(text) {
        if let Ok(message) = ChannelPointsMessage::parse(&data.message) {
            let _ = message.redemption();
        }
    }
    if let Ok(message) = ChannelPointsMessage::parse(text) {
        let _ = message.redemption();
    }
});
