//! Serialized update loop.
//!
//! One task owns the poll timer, the stream connection and the receiving end of the stream's
//! event channel. Every store mutation coming from polling or streaming is applied from this
//! task, one at a time.
use std::{sync::Arc, time::Duration};

use tokio::{
    sync::mpsc,
    task::JoinHandle,
    time::{interval_at, Instant},
};

use crate::{
    evaluation_store::EvaluationStore,
    poller::Poller,
    sdk_codes,
    stream::{StreamClient, StreamEvent, StreamState},
    AuthSession, ClientConfig, FlagsApi, Target,
};

pub(crate) struct Pipeline {
    api: Arc<dyn FlagsApi>,
    store: Arc<EvaluationStore>,
    session: Arc<AuthSession>,
    target: Arc<Target>,
    poller: Poller,
    stream: Option<StreamClient>,
    events: mpsc::UnboundedReceiver<StreamEvent>,
    poll_interval: Duration,
}

impl Pipeline {
    pub(crate) fn new(
        config: &ClientConfig,
        api: Arc<dyn FlagsApi>,
        store: Arc<EvaluationStore>,
        session: Arc<AuthSession>,
        target: Arc<Target>,
    ) -> Pipeline {
        let (sender, events) = mpsc::unbounded_channel();
        let stream = config.stream_enabled.then(|| {
            StreamClient::new(
                Arc::clone(&api),
                Arc::clone(&session),
                sender,
                config.stream_read_timeout,
            )
        });
        let poller = Poller::new(
            Arc::clone(&api),
            Arc::clone(&store),
            config.poll_removes_missing_flags,
            config.verbose_level(),
        );

        Pipeline {
            api,
            store,
            session,
            target,
            poller,
            stream,
            events,
            poll_interval: config.poll_interval,
        }
    }

    /// Run the loop on a new task until the handle is aborted.
    pub(crate) fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        sdk_codes::info_polling_started(self.poll_interval.as_secs());
        let _stopped = sdk_codes::LogOnDrop(sdk_codes::info_polling_stopped);

        self.ensure_stream();

        let mut ticker = interval_at(Instant::now() + self.poll_interval, self.poll_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.poll().await;
                    self.ensure_stream();
                }
                Some(event) = self.events.recv() => {
                    self.handle_event(event).await;
                }
            }
        }
    }

    /// (Re)connect the stream unless it is connecting or open.
    fn ensure_stream(&mut self) {
        if let Some(stream) = &mut self.stream {
            if matches!(
                stream.state(),
                StreamState::Idle | StreamState::Ended | StreamState::Failed
            ) {
                stream.start();
            }
        }
    }

    async fn poll(&self) {
        // Errors are logged by the poller; the next tick retries.
        let _ = self.poller.poll_once(&self.session, &self.target).await;
    }

    pub(crate) async fn handle_event(&self, event: StreamEvent) {
        let environment = &self.session.environment_identifier;
        match event {
            StreamEvent::Started | StreamEvent::ReloadRequested => {
                self.poll().await;
            }
            StreamEvent::Ended { reason, error } => {
                if let Some(err) = error {
                    log::warn!(target: "ff", reason = reason.as_str(); "stream failed: {err}");
                }
                self.poll().await;
            }
            StreamEvent::FlagChanged(flag) => {
                match self
                    .api
                    .fetch_evaluation(&self.session, &flag, &self.target)
                    .await
                {
                    Ok(evaluation) => self.store.set_evaluation(environment, &flag, evaluation),
                    Err(err) => {
                        log::warn!(target: "ff", flag = flag.as_str(); "failed to fetch changed flag: {err}");
                    }
                }
            }
            StreamEvent::FlagsReplaced(evaluations) => {
                for evaluation in evaluations {
                    let flag = evaluation.flag_identifier.clone();
                    self.store.set_evaluation(environment, &flag, evaluation);
                }
            }
            StreamEvent::FlagRemoved(flag) => {
                self.store.remove_evaluation(environment, &flag);
            }
        }
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        if let Some(stream) = &mut self.stream {
            stream.stop();
        }
    }
}
