//! Push-update stream.
//!
//! [`StreamClient`] keeps at most one connection open. The body is framed as server-sent events;
//! events whose data names a `domain` are translated into [`StreamEvent`]s and sent to the owner
//! over a channel, everything else is a heartbeat and dropped.
use std::{
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use eventsource_stream::{EventStreamError, Eventsource};
use futures::StreamExt;
use serde::Deserialize;
use tokio::{sync::mpsc, task::JoinHandle};

use crate::{sdk_codes, AuthSession, Error, Evaluation, FlagsApi, Result};

/// Event data that doesn't contain this token is a heartbeat.
const PAYLOAD_MARKER: &str = "domain";

/// Notification sent by the stream to its owner.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// The connection is open.
    Started,
    /// The connection is gone. `error` is `None` on a clean end of stream.
    Ended {
        /// Human-readable cause.
        reason: String,
        /// The failure, if the stream did not end cleanly.
        error: Option<Error>,
    },
    /// The flag changed and its new evaluation must be fetched.
    FlagChanged(String),
    /// The event carried the new evaluations inline.
    FlagsReplaced(Vec<Evaluation>),
    /// The flag was deleted.
    FlagRemoved(String),
    /// Segment membership changed, every evaluation may be affected.
    ReloadRequested,
}

impl StreamEvent {
    /// Short name used in diagnostics.
    pub fn name(&self) -> &'static str {
        match self {
            StreamEvent::Started => "started",
            StreamEvent::Ended { .. } => "ended",
            StreamEvent::FlagChanged(_) => "flag-changed",
            StreamEvent::FlagsReplaced(_) => "flags-replaced",
            StreamEvent::FlagRemoved(_) => "flag-removed",
            StreamEvent::ReloadRequested => "reload-requested",
        }
    }
}

/// Connection lifecycle. `Ended` and `Failed` may be restarted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Not connected.
    Idle,
    /// Waiting for the server to answer.
    Connecting,
    /// Reading events.
    Streaming,
    /// The server closed the stream.
    Ended,
    /// Reading failed or timed out.
    Failed,
}

impl StreamState {
    fn is_active(self) -> bool {
        matches!(self, StreamState::Connecting | StreamState::Streaming)
    }
}

#[derive(Debug, Deserialize)]
struct Message {
    domain: String,
    event: String,
    #[serde(default)]
    identifier: String,
    #[serde(default)]
    evaluations: Vec<Evaluation>,
}

impl Message {
    fn into_event(self) -> Option<StreamEvent> {
        match (self.domain.as_str(), self.event.as_str()) {
            ("flag", "create" | "patch") if !self.evaluations.is_empty() => {
                Some(StreamEvent::FlagsReplaced(self.evaluations))
            }
            ("flag", "create" | "patch") if !self.identifier.is_empty() => {
                Some(StreamEvent::FlagChanged(self.identifier))
            }
            ("flag", "delete") if !self.identifier.is_empty() => {
                Some(StreamEvent::FlagRemoved(self.identifier))
            }
            ("target-segment", "create" | "patch" | "delete") => Some(StreamEvent::ReloadRequested),
            _ => None,
        }
    }
}

/// Parse the data of a single server-sent event.
///
/// Returns `Ok(None)` for heartbeats and for events this client has no use for. Data that names a
/// `domain` but does not parse is an error.
pub(crate) fn parse_data(data: &str) -> Result<Option<StreamEvent>> {
    if !data.contains(PAYLOAD_MARKER) {
        return Ok(None);
    }

    let payload = data.trim();
    let message: Message = serde_json::from_str(payload)
        .map_err(|err| Error::Stream(format!("malformed event {payload:?}: {err}")))?;

    Ok(message.into_event())
}

fn stream_error(err: EventStreamError<Error>) -> Error {
    match err {
        EventStreamError::Transport(err) => err,
        other => Error::Stream(other.to_string()),
    }
}

/// Owner of the streaming connection.
///
/// Dropping the client aborts the read loop.
pub struct StreamClient {
    api: Arc<dyn FlagsApi>,
    session: Arc<AuthSession>,
    events: mpsc::UnboundedSender<StreamEvent>,
    read_timeout: Duration,
    state: Arc<Mutex<StreamState>>,
    task: Option<JoinHandle<()>>,
}

impl StreamClient {
    pub(crate) fn new(
        api: Arc<dyn FlagsApi>,
        session: Arc<AuthSession>,
        events: mpsc::UnboundedSender<StreamEvent>,
        read_timeout: Duration,
    ) -> StreamClient {
        StreamClient {
            api,
            session,
            events,
            read_timeout,
            state: Arc::new(Mutex::new(StreamState::Idle)),
            task: None,
        }
    }

    /// Current connection state.
    pub fn state(&self) -> StreamState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Open the connection unless one is already connecting or open. Returns `true` if a new
    /// connection attempt was started.
    ///
    /// Must be called within a tokio runtime.
    pub fn start(&mut self) -> bool {
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if state.is_active() {
                return false;
            }
            *state = StreamState::Connecting;
        }

        if let Some(task) = self.task.take() {
            task.abort();
        }

        let reader = Reader {
            api: Arc::clone(&self.api),
            session: Arc::clone(&self.session),
            events: self.events.clone(),
            read_timeout: self.read_timeout,
            state: Arc::clone(&self.state),
        };
        self.task = Some(tokio::spawn(reader.run()));
        true
    }

    /// Close the connection. Does not notify the owner.
    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            sdk_codes::info_stream_stopped("stopped by client");
        }
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = StreamState::Idle;
    }
}

impl Drop for StreamClient {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// State moved into the read task.
struct Reader {
    api: Arc<dyn FlagsApi>,
    session: Arc<AuthSession>,
    events: mpsc::UnboundedSender<StreamEvent>,
    read_timeout: Duration,
    state: Arc<Mutex<StreamState>>,
}

impl Reader {
    async fn run(self) {
        let (state, reason, error) = match self.read().await {
            Ok(()) => (StreamState::Ended, "end of stream".to_owned(), None),
            Err(err) => (StreamState::Failed, err.to_string(), Some(err)),
        };

        self.set_state(state);
        sdk_codes::info_stream_stopped(&reason);
        // The owner may already be gone.
        let _ = self.events.send(StreamEvent::Ended { reason, error });
    }

    async fn read(&self) -> Result<()> {
        let mut body = self.api.open_stream(&self.session).await?.eventsource();

        self.set_state(StreamState::Streaming);
        sdk_codes::info_stream_connected();
        if self.events.send(StreamEvent::Started).is_err() {
            return Ok(());
        }

        loop {
            let event = match tokio::time::timeout(self.read_timeout, body.next()).await {
                Err(_elapsed) => return Err(Error::StreamTimeout),
                Ok(None) => return Ok(()),
                Ok(Some(event)) => event.map_err(stream_error)?,
            };

            // A malformed payload ends the stream; the owner re-synchronizes with a poll.
            let Some(event) = parse_data(&event.data)? else {
                continue;
            };
            sdk_codes::info_stream_event_received(event.name());
            if self.events.send(event).is_err() {
                return Ok(());
            }
        }
    }

    fn set_state(&self, state: StreamState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use tokio::sync::mpsc;

    use super::{parse_data, StreamClient, StreamEvent, StreamState};
    use crate::{
        api::mock::{test_session, MockApi},
        Error,
    };

    fn chunk(s: &str) -> crate::Result<Vec<u8>> {
        Ok(s.as_bytes().to_vec())
    }

    fn client(api: Arc<MockApi>) -> (StreamClient, mpsc::UnboundedReceiver<StreamEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let client = StreamClient::new(api, Arc::new(test_session()), tx, Duration::from_secs(60));
        (client, rx)
    }

    #[test]
    fn heartbeats_are_ignored() {
        for data in ["", "*", "keep-alive", "{}"] {
            assert!(parse_data(data).unwrap().is_none(), "{data:?}");
        }
    }

    #[test]
    fn flag_patch_is_a_change() {
        let event =
            parse_data(r#"{"event":"patch","domain":"flag","identifier":"dark-mode","version":3}"#)
                .unwrap();

        assert!(matches!(event, Some(StreamEvent::FlagChanged(flag)) if flag == "dark-mode"));
    }

    #[test]
    fn flag_create_is_a_change() {
        let event =
            parse_data(r#" {"event":"create","domain":"flag","identifier":"new-flag"} "#).unwrap();

        assert!(matches!(event, Some(StreamEvent::FlagChanged(flag)) if flag == "new-flag"));
    }

    #[test]
    fn flag_delete_is_a_removal() {
        let event =
            parse_data(r#"{"event":"delete","domain":"flag","identifier":"dark-mode"}"#).unwrap();

        assert!(matches!(event, Some(StreamEvent::FlagRemoved(flag)) if flag == "dark-mode"));
    }

    #[test]
    fn inline_evaluations_replace_flags() {
        let event = parse_data(
            r#"{"event":"patch","domain":"flag","identifier":"a","evaluations":[{"flag":"a","value":"true","kind":"boolean","identifier":"true"}]}"#,
        )
        .unwrap();

        match event {
            Some(StreamEvent::FlagsReplaced(evaluations)) => {
                assert_eq!(evaluations.len(), 1);
                assert_eq!(evaluations[0].flag_identifier, "a");
                assert_eq!(evaluations[0].value, "true");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn segment_changes_request_reload() {
        for event in ["create", "patch", "delete"] {
            let data =
                format!(r#"{{"event":"{event}","domain":"target-segment","identifier":"beta"}}"#);
            assert!(
                matches!(parse_data(&data).unwrap(), Some(StreamEvent::ReloadRequested)),
                "{event}"
            );
        }
    }

    #[test]
    fn unknown_events_are_ignored() {
        let event =
            parse_data(r#"{"event":"patch","domain":"environment","identifier":"x"}"#).unwrap();
        assert!(event.is_none());

        let event =
            parse_data(r#"{"event":"archive","domain":"flag","identifier":"x"}"#).unwrap();
        assert!(event.is_none());
    }

    #[test]
    fn malformed_payload_is_an_error() {
        let result = parse_data(r#"{"domain": "flag", "event""#);

        assert!(matches!(result, Err(Error::Stream(_))));
    }

    #[tokio::test]
    async fn delivers_events_then_ends() {
        let api = Arc::new(MockApi::default());
        api.push_stream(vec![
            chunk(": keep-alive\n\n"),
            chunk("event: *\ndata: {\"event\":\"patch\",\"domain\":\"flag\","),
            chunk("\"identifier\":\"a\"}\n\n"),
            chunk("event: *\ndata: {\"event\":\"delete\",\"domain\":\"flag\",\"identifier\":\"b\"}\n\n"),
        ]);
        let (mut stream, mut rx) = client(api.clone());

        assert!(stream.start());

        assert!(matches!(rx.recv().await, Some(StreamEvent::Started)));
        assert!(matches!(rx.recv().await, Some(StreamEvent::FlagChanged(flag)) if flag == "a"));
        assert!(matches!(rx.recv().await, Some(StreamEvent::FlagRemoved(flag)) if flag == "b"));
        assert!(matches!(
            rx.recv().await,
            Some(StreamEvent::Ended { error: None, .. })
        ));
        assert_eq!(stream.state(), StreamState::Ended);
    }

    #[tokio::test]
    async fn malformed_event_fails_the_stream() {
        let api = Arc::new(MockApi::default());
        api.push_stream(vec![
            chunk("data: {not json but has domain}\n\n"),
            chunk("data: {\"event\":\"delete\",\"domain\":\"flag\",\"identifier\":\"b\"}\n\n"),
        ]);
        let (mut stream, mut rx) = client(api);

        stream.start();

        assert!(matches!(rx.recv().await, Some(StreamEvent::Started)));
        assert!(matches!(
            rx.recv().await,
            Some(StreamEvent::Ended {
                error: Some(Error::Stream(_)),
                ..
            })
        ));
        assert_eq!(stream.state(), StreamState::Failed);
    }

    #[tokio::test]
    async fn read_error_fails_the_stream() {
        let api = Arc::new(MockApi::default());
        api.push_stream(vec![Err(Error::Stream("connection reset".to_owned()))]);
        let (mut stream, mut rx) = client(api);

        stream.start();

        assert!(matches!(rx.recv().await, Some(StreamEvent::Started)));
        assert!(matches!(
            rx.recv().await,
            Some(StreamEvent::Ended {
                error: Some(Error::Stream(reason)),
                ..
            }) if reason == "connection reset"
        ));
        assert_eq!(stream.state(), StreamState::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_stream_times_out() {
        // No scripted body: the mock keeps the connection open without sending anything.
        let api = Arc::new(MockApi::default());
        let (mut stream, mut rx) = client(api);

        stream.start();

        assert!(matches!(rx.recv().await, Some(StreamEvent::Started)));
        assert!(matches!(
            rx.recv().await,
            Some(StreamEvent::Ended {
                error: Some(Error::StreamTimeout),
                ..
            })
        ));
        assert_eq!(stream.state(), StreamState::Failed);
    }

    #[tokio::test]
    async fn does_not_connect_twice() {
        let api = Arc::new(MockApi::default());
        let (mut stream, mut rx) = client(api.clone());

        assert!(stream.start());
        assert!(matches!(rx.recv().await, Some(StreamEvent::Started)));
        assert!(!stream.start());

        assert_eq!(api.stream_calls.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(stream.state(), StreamState::Streaming);

        stream.stop();
        assert_eq!(stream.state(), StreamState::Idle);
    }

    #[tokio::test]
    async fn can_restart_after_end() {
        let api = Arc::new(MockApi::default());
        api.push_stream(vec![]);
        let (mut stream, mut rx) = client(api.clone());

        stream.start();
        assert!(matches!(rx.recv().await, Some(StreamEvent::Started)));
        assert!(matches!(rx.recv().await, Some(StreamEvent::Ended { .. })));

        assert!(stream.start());
        assert!(matches!(rx.recv().await, Some(StreamEvent::Started)));
        assert_eq!(api.stream_calls.load(std::sync::atomic::Ordering::SeqCst), 2);
    }
}
