//! Plans GraphQL operations against heterogeneous data sources and resolves
//! the resulting plans into JSON responses.
//!
//! The pipeline has two halves:
//! * [`plan::Planner`] walks an operation against a schema and a
//!   [`Configuration`] and produces a [`plan::Plan`];
//! * [`resolve::Resolver`] executes a plan: it issues fetches through
//!   [`resolve::DataSource`] implementations, deduplicates identical in-flight
//!   fetches and writes the response incrementally with GraphQL null
//!   propagation.

#![cfg_attr(feature = "failfast", allow(unreachable_code))]

macro_rules! failfast_debug {
    ($($tokens:tt)+) => {{
        tracing::debug!($($tokens)+);
        #[cfg(feature = "failfast")]
        panic!(
            "failfast triggered. \
            Please remove the feature failfast if you don't want to see these panics"
        );
    }};
}

macro_rules! failfast_error {
    ($($tokens:tt)+) => {{
        tracing::error!($($tokens)+);
        #[cfg(feature = "failfast")]
        panic!(
            "failfast triggered. \
            Please remove the feature failfast if you don't want to see these panics"
        );
    }};
}

pub mod configuration;
mod context;
pub mod error;
pub mod graphql;
pub mod json_ext;
pub mod plan;
pub mod resolve;
pub mod sources;

pub use configuration::Configuration;
pub use context::Context;
pub use error::FetchError;
pub use error::PlanningError;
pub use error::ResolveError;
