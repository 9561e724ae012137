//! Subscriptions over plain HTTP endpoints.
//!
//! Every registration spawns a task that loads the same request on an interval and publishes the
//! responses as subscription events.
use std::collections::HashMap;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::error::FetchError;
use crate::resolve::BufPair;
use crate::resolve::DataSource;
use crate::resolve::Trigger;
use crate::resolve::TriggerManager;
use crate::Context;

/// The id of the polling trigger manager.
pub const MANAGER_ID: &str = "http_polling_stream";

#[derive(Debug, Deserialize)]
struct PollingInput {
    /// Milliseconds between loads.
    interval: u64,
    request_input: serde_json::Value,
    #[serde(default)]
    skip_publish_same_response: bool,
}

/// Serves subscription triggers by polling a data source.
pub struct PollingTriggerManager {
    data_source: Arc<dyn DataSource>,
    registrations: Arc<Mutex<HashMap<u64, CancellationToken>>>,
    next_id: AtomicU64,
}

impl PollingTriggerManager {
    pub fn new(data_source: Arc<dyn DataSource>) -> Self {
        Self {
            data_source,
            registrations: Default::default(),
            next_id: AtomicU64::new(0),
        }
    }

    /// The number of running polls.
    pub fn len(&self) -> usize {
        self.registrations.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl TriggerManager for PollingTriggerManager {
    fn id(&self) -> &str {
        MANAGER_ID
    }

    async fn register(&self, context: &Context, input: Bytes) -> Result<Trigger, FetchError> {
        let input: PollingInput =
            serde_json::from_slice(&input).map_err(|err| FetchError::MalformedInput {
                reason: err.to_string(),
            })?;
        let request = serde_json::to_vec(&input.request_input)
            .map(Bytes::from)
            .map_err(|err| FetchError::MalformedInput {
                reason: err.to_string(),
            })?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let token = context.cancellation().child_token();
        self.registrations.lock().insert(id, token.clone());

        let (sender, receiver) = mpsc::channel(1);
        let poll = Poll {
            data_source: self.data_source.clone(),
            context: context.clone(),
            request,
            interval: Duration::from_millis(input.interval.max(1)),
            skip_publish_same_response: input.skip_publish_same_response,
        };
        tokio::spawn(
            poll.run(sender, token)
                .instrument(tracing::trace_span!("polling", id)),
        );
        tracing::trace!(id, interval = input.interval, "polling trigger registered");

        let registrations = self.registrations.clone();
        Ok(Trigger::new(receiver).on_unregister(move || {
            if let Some(token) = registrations.lock().remove(&id) {
                token.cancel();
                tracing::trace!(id, "polling trigger unregistered");
            }
        }))
    }
}

struct Poll {
    data_source: Arc<dyn DataSource>,
    context: Context,
    request: Bytes,
    interval: Duration,
    skip_publish_same_response: bool,
}

impl Poll {
    async fn run(self, sender: mpsc::Sender<Bytes>, token: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        let mut previous: Option<Bytes> = None;
        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let mut out = BufPair::new();
            let loaded = tokio::select! {
                biased;
                _ = token.cancelled() => break,
                loaded = self.data_source.load(&self.context, &self.request, &mut out) => loaded,
            };
            if let Err(err) = loaded {
                tracing::error!(error = %err, "polling load failed");
                continue;
            }
            if out.has_errors() {
                tracing::error!(
                    errors = %String::from_utf8_lossy(&out.errors),
                    "polling load returned errors"
                );
                continue;
            }

            let payload = out.data.freeze();
            if self.skip_publish_same_response && previous.as_ref() == Some(&payload) {
                continue;
            }
            previous = Some(payload.clone());
            if sender.send(payload).await.is_err() {
                break;
            }
        }
        tracing::trace!("polling stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use pretty_assertions::assert_eq;

    use super::*;

    /// Answers with the payloads in order, then repeats the last one.
    struct Sequence {
        payloads: Vec<&'static str>,
        loads: AtomicUsize,
    }

    impl Sequence {
        fn new(payloads: Vec<&'static str>) -> Arc<Self> {
            Arc::new(Self {
                payloads,
                loads: AtomicUsize::new(0),
            })
        }

        fn loads(&self) -> usize {
            self.loads.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl DataSource for Sequence {
        fn unique_identifier(&self) -> Bytes {
            Bytes::from_static(b"sequence")
        }

        async fn load(
            &self,
            _context: &Context,
            input: &[u8],
            out: &mut BufPair,
        ) -> Result<(), FetchError> {
            assert_eq!(input, br#"{"method":"GET","url":"https://example.com/status"}"#);
            let load = self.loads.fetch_add(1, Ordering::SeqCst);
            let payload = self.payloads[load.min(self.payloads.len() - 1)];
            if payload == "error" {
                return Err(FetchError::SubrequestFailed {
                    service: "status".to_string(),
                    reason: "unavailable".to_string(),
                });
            }
            out.data.extend_from_slice(payload.as_bytes());
            Ok(())
        }
    }

    fn input(skip_publish_same_response: bool) -> Bytes {
        Bytes::from(format!(
            r#"{{"interval":100,"request_input":{{"method":"GET","url":"https://example.com/status"}},"skip_publish_same_response":{skip_publish_same_response}}}"#
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn publishes_every_response() {
        let source = Sequence::new(vec![r#"{"n":1}"#, r#"{"n":1}"#, r#"{"n":2}"#]);
        let manager = PollingTriggerManager::new(source.clone());
        let mut trigger = manager
            .register(&Context::default(), input(false))
            .await
            .unwrap();

        let mut events = Vec::new();
        for _ in 0..3 {
            events.push(trigger.next().await.unwrap());
        }
        assert_eq!(
            events,
            vec![
                Bytes::from_static(br#"{"n":1}"#),
                Bytes::from_static(br#"{"n":1}"#),
                Bytes::from_static(br#"{"n":2}"#)
            ]
        );
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn skips_identical_responses_and_load_errors() {
        let source = Sequence::new(vec![
            r#"{"n":1}"#,
            r#"{"n":1}"#,
            "error",
            r#"{"n":1}"#,
            r#"{"n":2}"#,
        ]);
        let manager = PollingTriggerManager::new(source.clone());
        let mut trigger = manager
            .register(&Context::default(), input(true))
            .await
            .unwrap();

        assert_eq!(
            trigger.next().await.unwrap(),
            Bytes::from_static(br#"{"n":1}"#)
        );
        assert_eq!(
            trigger.next().await.unwrap(),
            Bytes::from_static(br#"{"n":2}"#)
        );
        assert_eq!(source.loads(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_the_trigger_stops_polling() {
        let source = Sequence::new(vec![r#"{"n":1}"#]);
        let manager = PollingTriggerManager::new(source.clone());
        let mut trigger = manager
            .register(&Context::default(), input(false))
            .await
            .unwrap();
        trigger.next().await.unwrap();
        assert_eq!(manager.len(), 1);

        drop(trigger);
        assert!(manager.is_empty());
        tokio::time::sleep(Duration::from_millis(50)).await;
        let loads = source.loads();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(source.loads(), loads);
    }

    #[tokio::test]
    async fn rejects_malformed_input() {
        let manager = PollingTriggerManager::new(Sequence::new(vec!["{}"]));
        let err = manager
            .register(&Context::default(), Bytes::from_static(b"{\"interval\":1}"))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::MalformedInput { .. }));
        assert!(manager.is_empty());
    }
}
