use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::FetchError;
use crate::resolve::template::InputTemplate;
use crate::resolve::template::Variable;
use crate::resolve::GraphQLResponse;
use crate::Context;

/// Starts the event stream of a subscription.
#[derive(Clone, Debug, PartialEq)]
pub struct GraphQLSubscriptionTrigger {
    /// The id of the [`TriggerManager`] serving the stream.
    pub manager_id: String,
    pub input: InputTemplate,
    pub variables: Vec<Variable>,
}

/// A subscription plan: a trigger and the response resolved for every event.
#[derive(Clone, Debug, PartialEq)]
pub struct GraphQLSubscription {
    pub trigger: GraphQLSubscriptionTrigger,
    /// Resolved once per event, with the event payload as root data.
    pub response: GraphQLResponse,
}

/// Produces event streams for subscriptions.
#[async_trait]
pub trait TriggerManager: Send + Sync {
    /// Identifies the manager in subscription plans.
    fn id(&self) -> &str;

    /// Starts a stream for the rendered trigger input.
    ///
    /// The stream stops when the returned [`Trigger`] is dropped.
    async fn register(&self, context: &Context, input: Bytes) -> Result<Trigger, FetchError>;
}

/// A registered event stream.
pub struct Trigger {
    events: mpsc::Receiver<Bytes>,
    unregister: Option<Box<dyn FnOnce() + Send>>,
}

impl Trigger {
    pub fn new(events: mpsc::Receiver<Bytes>) -> Self {
        Self {
            events,
            unregister: None,
        }
    }

    /// Runs `unregister` when the trigger is dropped.
    pub fn on_unregister(mut self, unregister: impl FnOnce() + Send + 'static) -> Self {
        self.unregister = Some(Box::new(unregister));
        self
    }

    /// The next event payload, `None` once the stream is closed.
    pub async fn next(&mut self) -> Option<Bytes> {
        self.events.recv().await
    }
}

impl Drop for Trigger {
    fn drop(&mut self) {
        if let Some(unregister) = self.unregister.take() {
            tracing::trace!("unregistering trigger");
            unregister();
        }
    }
}

impl fmt::Debug for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Trigger").finish_non_exhaustive()
    }
}
