//! Stable diagnostic codes.
//!
//! Every message is emitted through the `log` facade under the `ff` target and is prefixed with
//! `SDKCODE(<area>:<code>)`, so operators can grep for them regardless of the logger in use.

/// Emits a code when dropped, so it is also logged when a task is aborted.
pub(crate) struct LogOnDrop(pub(crate) fn());

impl Drop for LogOnDrop {
    fn drop(&mut self) {
        (self.0)()
    }
}

pub(crate) fn error_missing_sdk_key() {
    log::error!(target: "ff", "SDKCODE(init:1002): Missing or empty API key");
}

pub(crate) fn info_sdk_auth_ok(version: &str) {
    log::info!(target: "ff", version; "SDKCODE(auth:2000): Authenticated ok");
}

pub(crate) fn info_polling_started(interval_secs: u64) {
    log::info!(target: "ff", interval_secs; "SDKCODE(poll:4000): Polling started");
}

pub(crate) fn info_polling_stopped() {
    log::info!(target: "ff", "SDKCODE(poll:4001): Polling stopped");
}

pub(crate) fn info_stream_connected() {
    log::info!(target: "ff", "SDKCODE(stream:5000): SSE stream connected ok");
}

pub(crate) fn info_stream_stopped(reason: &str) {
    log::info!(target: "ff", reason; "SDKCODE(stream:5001): SSE stream disconnected");
}

pub(crate) fn info_stream_event_received(event: &str) {
    log::info!(target: "ff", event; "SDKCODE(stream:5002): SSE event received");
}

pub(crate) fn warn_default_variation_served(identifier: &str, default_value: &str, reason: &str) {
    log::warn!(target: "ff",
               identifier,
               default_value,
               reason;
               "SDKCODE(eval:6001): Default variation was served");
}

pub(crate) fn info_metrics_timer_started(interval_secs: u64) {
    log::info!(target: "ff", interval_secs; "SDKCODE(metric:7000): Metrics timer started");
}

pub(crate) fn info_metrics_timer_exited() {
    log::info!(target: "ff", "SDKCODE(metric:7001): Metrics timer exited");
}

pub(crate) fn warn_posting_metrics_failed(reason: &str) {
    log::warn!(target: "ff", reason; "SDKCODE(metric:7002): Posting metrics failed");
}

pub(crate) fn warn_metrics_buffer_full(dropped: u64) {
    log::warn!(target: "ff",
               dropped;
               "SDKCODE(metric:7008): Metrics buffer is full and metrics will be discarded");
}
