//! A client-side SDK for Harness Feature Flags.
//!
//! # Overview
//!
//! The SDK revolves around a [`Client`] bound to a single [`Target`] (an end user or a device).
//! Flag evaluation happens on the server: the client keeps a local copy of the evaluations for its
//! target and serves reads from it without waiting on the network.
//!
//! The local copy is kept up to date by:
//! - a full refresh on a fixed interval (at least 60 seconds);
//! - a push stream that announces changed and deleted flags as they happen;
//! - an optional on-demand fetch ([`Client::bool_variation_lazy`] and friends) with a short-lived
//!   cache that also remembers failures.
//!
//! Every served variation is counted and reported back to the server in periodic batches, unless
//! analytics are disabled in [`ClientConfig`].
//!
//! # Error Handling
//!
//! Errors are represented by the [`Error`] enum.
//!
//! Only [`Client::initialize`] and [`Client::flush_metrics`] return errors. Variation functions
//! never fail: they serve the caller's default value and log the reason.
//!
//! # Logging
//!
//! The package uses the [`log`](https://docs.rs/log/latest/log/) crate for logging messages, under
//! the `ff` target. Lifecycle messages carry stable `SDKCODE(area:code)` prefixes.
//!
//! # Examples
//!
//! A runnable example lives in `demos/getting_started.rs`.

#![warn(rustdoc::missing_crate_level_docs)]
#![warn(missing_docs)]

mod api;
mod auth;
mod client;
mod config;
mod error;
mod evaluation;
mod evaluation_store;
mod http_api;
mod metrics;
mod pipeline;
mod poller;
mod sdk_codes;
mod sdk_metadata;
mod stream;

pub use api::{ByteStream, FlagsApi, KeyValue, Metrics, MetricsData, TargetData};
pub use auth::{AuthSession, Target};
pub use client::Client;
pub use config::{ClientConfig, NetworkChecker};
pub use error::{Error, Result};
pub use evaluation::{Evaluation, VariationValue};
pub use evaluation_store::{CacheEntry, EvaluationStore, FetchFailure, NotFound, CACHE_TTL_SECONDS};
pub use http_api::HttpApi;
pub use metrics::{AnalyticsKey, FrequencyMap, MetricsAggregator, Snapshot};
pub use sdk_metadata::SdkMetadata;
pub use stream::{StreamEvent, StreamState};
