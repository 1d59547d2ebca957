use biometrics::{Collector, Counter, Moments};

pub(crate) static CLIENT_REQUESTS: Counter = Counter::new("dial_chat.client.requests");
pub(crate) static CLIENT_REQUEST_ERRORS: Counter =
    Counter::new("dial_chat.client.request_errors");
pub(crate) static CLIENT_REQUEST_DURATION: Moments =
    Moments::new("dial_chat.client.request_duration_seconds");

pub(crate) static STREAM_FRAGMENTS: Counter = Counter::new("dial_chat.stream.fragments");
pub(crate) static STREAM_BYTES: Counter = Counter::new("dial_chat.stream.bytes");
pub(crate) static STREAM_DROPPED_FRAMES: Counter =
    Counter::new("dial_chat.stream.dropped_frames");
pub(crate) static STREAM_TRUNCATED: Counter = Counter::new("dial_chat.stream.truncated");

pub(crate) static SESSION_TURNS: Counter = Counter::new("dial_chat.session.turns");
pub(crate) static SESSION_ROLLBACKS: Counter = Counter::new("dial_chat.session.rollbacks");

/// Register this crate's biometrics with the provided collector.
pub fn register_biometrics(collector: Collector) {
    collector.register_counter(&CLIENT_REQUESTS);
    collector.register_counter(&CLIENT_REQUEST_ERRORS);
    collector.register_moments(&CLIENT_REQUEST_DURATION);

    collector.register_counter(&STREAM_FRAGMENTS);
    collector.register_counter(&STREAM_BYTES);
    collector.register_counter(&STREAM_DROPPED_FRAMES);
    collector.register_counter(&STREAM_TRUNCATED);

    collector.register_counter(&SESSION_TURNS);
    collector.register_counter(&SESSION_ROLLBACKS);
}
