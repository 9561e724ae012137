//! Planning of operations.
//!
//! The [`Planner`] walks an operation against the schema and the [`Configuration`]: every root
//! field of a configured data source gets a sub-planner, every sub-planner produces a fetch and
//! the fields are turned into the node tree the resolver writes the response from.

mod data_source;
mod visitor;
pub mod walker;


use apollo_compiler::ast;
use apollo_compiler::Schema;

pub use self::data_source::literal_to_json;
pub use self::data_source::variables_in;
pub use self::data_source::ArgumentBinding;
pub use self::data_source::ArgumentValue;
pub use self::data_source::DataSourcePlanner;
pub use self::data_source::DataSourcePlannerFactory;
pub use self::data_source::DataSourceRegistry;
pub use self::data_source::FetchConfiguration;
pub use self::data_source::FieldContext;
pub use self::data_source::PlannerConfiguration;
pub use self::data_source::SubPlannerState;
pub use self::data_source::SubscriptionConfiguration;
use self::visitor::PlanningVisitor;
use crate::error::PlanningError;
use crate::resolve::GraphQLResponse;
use crate::resolve::GraphQLSubscription;
use crate::Configuration;

/// The plan of an operation.
#[derive(Clone, Debug, PartialEq)]
pub enum Plan {
    /// Queries and mutations: one response.
    Synchronous(SynchronousResponsePlan),
    /// Subscriptions: one response per event.
    Subscription(SubscriptionResponsePlan),
}

#[derive(Clone, Debug, PartialEq)]
pub struct SynchronousResponsePlan {
    pub response: GraphQLResponse,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SubscriptionResponsePlan {
    pub response: GraphQLSubscription,
}

/// Plans operations against a schema.
///
/// Planning does not depend on variables: a plan can be cached per operation and shared by
/// every resolution of it.
pub struct Planner {
    schema: Schema,
    configuration: Configuration,
    registry: DataSourceRegistry,
}

impl Planner {
    pub fn new(schema: Schema, configuration: Configuration, registry: DataSourceRegistry) -> Self {
        Self {
            schema,
            configuration,
            registry,
        }
    }

    pub fn configuration(&self) -> &Configuration {
        &self.configuration
    }

    /// Plans the operation named `operation_name`, or the only operation of `document`.
    pub fn plan(
        &self,
        document: &ast::Document,
        operation_name: Option<&str>,
    ) -> Result<Plan, PlanningError> {
        let mut visitor = PlanningVisitor::new(&self.schema, &self.configuration, &self.registry);
        walker::document(&mut visitor, document, operation_name)?;
        let plan = visitor.into_plan();
        if let Ok(plan) = &plan {
            let kind = match plan {
                Plan::Synchronous(_) => "synchronous",
                Plan::Subscription(_) => "subscription",
            };
            tracing::debug!(operation = operation_name.unwrap_or_default(), kind, "operation planned");
        }
        plan
    }
}
