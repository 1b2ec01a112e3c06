pub const TOPIC_ANNOUNCE: &str = "outTopic";

pub const ANNOUNCE_PAYLOAD: &str = "hello world";

pub fn telemetry_payload(counter: u64) -> String {
    format!("{ANNOUNCE_PAYLOAD} #{counter}")
}
