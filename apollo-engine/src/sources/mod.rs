//! Built-in data source kinds.
//!
//! Sub-planners only describe requests: the fetch inputs they produce are JSON documents that a
//! [`DataSource`] implementation turns into actual HTTP calls.
use std::sync::Arc;

use crate::plan::DataSourceRegistry;
use crate::resolve::DataSource;

pub mod graphql;
pub mod polling;
pub mod rest;

/// A registry with the `graphql` and `rest` kinds, loading through `graphql` and `rest`.
pub fn registry(graphql: Arc<dyn DataSource>, rest: Arc<dyn DataSource>) -> DataSourceRegistry {
    DataSourceRegistry::new()
        .register(graphql::GraphQLPlannerFactory::new(graphql))
        .register(rest::RestPlannerFactory::new(rest))
}
