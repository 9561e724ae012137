//! Execution of response plans.

mod buf_pair;
mod fetch;
mod node;
mod resolver;
mod single_flight;
mod subscription;
pub mod template;
#[cfg(test)]
mod tests;

use async_trait::async_trait;
use bytes::Bytes;

pub use self::buf_pair::BufPair;
pub use self::buf_pair::BufPairPool;
pub use self::fetch::Fetch;
pub use self::fetch::ParallelFetch;
pub use self::fetch::SerialFetch;
pub use self::fetch::SingleFetch;
pub use self::node::Array;
pub use self::node::Field;
pub use self::node::Node;
pub use self::node::Object;
pub use self::node::Scalar;
pub use self::node::SkipCondition;
pub use self::resolver::Resolver;
pub use self::resolver::EXECUTE_SPAN_NAME;
pub use self::resolver::FETCH_SPAN_NAME;
pub use self::resolver::NON_NULLABLE_FIELD_MESSAGE;
pub use self::resolver::SUBSCRIPTION_EVENT_SPAN_NAME;
pub use self::subscription::GraphQLSubscription;
pub use self::subscription::GraphQLSubscriptionTrigger;
pub use self::subscription::Trigger;
pub use self::subscription::TriggerManager;
pub use self::template::InputTemplate;
pub use self::template::Rendering;
pub use self::template::Variable;
pub use self::template::VariableSource;
use crate::error::FetchError;
use crate::Context;

/// A backend the engine loads data from.
///
/// Implementations receive the rendered input of a fetch and write the upstream data into
/// `out.data`. Upstream GraphQL errors are appended to `out.errors` (see [`BufPair::write_err`]);
/// returning an `Err` is reserved for failures of the load itself and is recorded the same way.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DataSource: Send + Sync {
    /// Identifies the data source for deduplication: identical inputs sent to data sources with
    /// the same identity share one load.
    fn unique_identifier(&self) -> Bytes;

    async fn load(
        &self,
        context: &Context,
        input: &[u8],
        out: &mut BufPair,
    ) -> Result<(), FetchError>;
}

/// The plan of a GraphQL response.
#[derive(Clone, Debug, PartialEq)]
pub struct GraphQLResponse {
    /// The root object, written under `data`.
    pub data: Node,
}
