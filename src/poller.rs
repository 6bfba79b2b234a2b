//! Full refresh of the evaluation set.
//!
//! The poll cadence is owned by the pipeline; [`Poller::poll_once`] performs a single refresh.
use std::sync::Arc;

use crate::{evaluation_store::EvaluationStore, AuthSession, FlagsApi, Result, Target};

pub(crate) struct Poller {
    api: Arc<dyn FlagsApi>,
    store: Arc<EvaluationStore>,
    /// Replace the flag set instead of merging into it.
    remove_missing: bool,
    level: log::Level,
}

impl Poller {
    pub(crate) fn new(
        api: Arc<dyn FlagsApi>,
        store: Arc<EvaluationStore>,
        remove_missing: bool,
        level: log::Level,
    ) -> Poller {
        Poller {
            api,
            store,
            remove_missing,
            level,
        }
    }

    /// Fetch every evaluation for `target` and write it into the store. Returns the number of
    /// evaluations received.
    ///
    /// On error the store is left untouched.
    pub(crate) async fn poll_once(&self, session: &AuthSession, target: &Target) -> Result<usize> {
        log::log!(target: "ff", self.level, "polling for flags");

        let evaluations = match self.api.fetch_evaluations(session, target).await {
            Ok(evaluations) => evaluations,
            Err(err) => {
                log::warn!(target: "ff", "error while polling for flags: {err}");
                return Err(err);
            }
        };

        let count = evaluations.len();
        let environment = &session.environment_identifier;
        if self.remove_missing {
            let removed = self.store.replace_all(environment, evaluations);
            if removed > 0 {
                log::debug!(target: "ff", removed; "dropped flags missing from poll response");
            }
        } else {
            for evaluation in evaluations {
                let flag = evaluation.flag_identifier.clone();
                self.store.set_evaluation(environment, &flag, evaluation);
            }
        }

        log::log!(target: "ff", self.level, count; "received flags");
        Ok(count)
    }
}
