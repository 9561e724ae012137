//! Engine errors.
use displaydoc::Display;
use serde::Serialize;
use thiserror::Error;

pub use crate::configuration::ConfigurationError;
use crate::graphql::Error;
use crate::json_ext::Path;
use crate::json_ext::Value;

/// Error types for fetches.
///
/// These never fail a request: they are converted to JSON for [`struct@Error`] and written into
/// the errors of the buffer owned by the failing fetch.
#[derive(Error, Display, Debug, Clone, Serialize, Eq, PartialEq)]
#[serde(untagged)]
#[ignore_extra_doc_attributes]
#[non_exhaustive]
pub enum FetchError {
    /// missing template variable: '{name}'
    TemplateVariableMissing {
        /// Name of the variable, prefixed by its source.
        name: String,
    },

    /// fetch input was malformed: {reason}
    MalformedInput {
        /// The reason the input could not be used.
        reason: String,
    },

    /// request to '{service}' failed: {reason}
    ///
    /// note that this relates to a transport error and not a GraphQL error
    SubrequestFailed {
        /// The data source that failed.
        service: String,

        /// The reason the load failed.
        reason: String,
    },

    /// response was malformed: {reason}
    MalformedResponse {
        /// The reason the deserialization failed.
        reason: String,
    },

    /// fetch was cancelled
    Cancelled,
}

impl FetchError {
    /// Convert the fetch error to a GraphQL error.
    pub fn to_graphql_error(&self, path: Option<Path>) -> Error {
        let mut value: Value = serde_json_bytes::to_value(self).unwrap_or_default();
        let mut extensions = value.as_object_mut().map(std::mem::take).unwrap_or_default();
        if let FetchError::SubrequestFailed { service, .. } = self {
            extensions
                .entry("service")
                .or_insert_with(|| service.clone().into());
        }

        Error::builder()
            .message(self.to_string())
            .and_path(path)
            .extension_code(self.extension_code())
            .extensions(extensions)
            .build()
    }

    /// The `code` extension of the matching GraphQL error.
    pub fn extension_code(&self) -> String {
        match self {
            FetchError::TemplateVariableMissing { .. } => "TEMPLATE_VARIABLE_MISSING",
            FetchError::MalformedInput { .. } => "MALFORMED_INPUT",
            FetchError::SubrequestFailed { .. } => "SUBREQUEST_FAILED",
            FetchError::MalformedResponse { .. } => "MALFORMED_RESPONSE",
            FetchError::Cancelled => "FETCH_CANCELLED",
        }
        .to_string()
    }
}

/// Error types for planning.
///
/// All of them are configuration errors: they are returned before anything is resolved.
#[derive(Error, Display, Debug, Clone, Eq, PartialEq)]
#[non_exhaustive]
pub enum PlanningError {
    /// no planner registered for data source kind '{0}'
    UnknownDataSourceKind(String),

    /// invalid configuration for data source '{kind}': {reason}
    InvalidDataSourceConfiguration {
        /// Kind of the data source.
        kind: String,
        /// The reason the configuration was rejected.
        reason: String,
    },

    /// operation '{0}' not found in document
    UnknownOperation(String),

    /// document contains several operations, an operation name is required
    AmbiguousOperation,

    /// schema has no root type for {0} operations
    MissingRootOperation(String),

    /// type '{0}' is not defined in the schema
    UnknownType(String),

    /// type '{type_name}' has no field '{field_name}'
    UnknownField {
        /// The enclosing type.
        type_name: String,
        /// The missing field.
        field_name: String,
    },

    /// no data source is configured for root field '{type_name}.{field_name}'
    MissingDataSource {
        /// The root type.
        type_name: String,
        /// The field without data source.
        field_name: String,
    },

    /// data source '{0}' cannot plan subscriptions
    SubscriptionUnsupported(String),
}

/// Error types for resolution.
///
/// Upstream failures are written into the response instead; these abort the resolution before
/// any output is produced.
#[derive(Error, Display, Debug, Clone, Eq, PartialEq)]
#[non_exhaustive]
pub enum ResolveError {
    /// field references buffer {0} but no fetch of its object produces it
    UnknownBuffer(usize),

    /// no trigger manager registered with id '{0}'
    UnknownTriggerManager(String),

    /// could not start the subscription trigger: {0}
    Trigger(FetchError),
}

pub(crate) fn parse_error_objects(errors: &[u8]) -> Result<Vec<Error>, FetchError> {
    let mut list = Vec::with_capacity(errors.len() + 2);
    list.push(b'[');
    list.extend_from_slice(errors);
    list.push(b']');
    serde_json::from_slice(&list).map_err(|err| FetchError::MalformedResponse {
        reason: err.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use serde_json_bytes::json;

    use super::*;

    #[test]
    fn fetch_error_to_graphql_error() {
        let error = FetchError::SubrequestFailed {
            service: "accounts".to_string(),
            reason: "connection refused".to_string(),
        }
        .to_graphql_error(Some(Path::from("me/name")));

        assert_eq!(
            serde_json_bytes::to_value(&error).unwrap(),
            json!({
                "message": "request to 'accounts' failed: connection refused",
                "path": ["me", "name"],
                "extensions": {
                    "service": "accounts",
                    "reason": "connection refused",
                    "code": "SUBREQUEST_FAILED"
                }
            })
        );
    }

    #[test]
    fn cancelled_error_only_carries_code() {
        let error = FetchError::Cancelled.to_graphql_error(None);
        assert_eq!(error.message, "fetch was cancelled");
        assert_eq!(
            error.extensions.get("code"),
            Some(&Value::from("FETCH_CANCELLED"))
        );
        assert_eq!(error.extensions.len(), 1);
    }

    #[test]
    fn error_objects_are_parsed_from_comma_separated_list() {
        let errors =
            parse_error_objects(br#"{"message":"one"},{"message":"two","path":["a",0]}"#)
                .unwrap();
        assert_eq!(errors.len(), 2);
        assert_eq!(errors[1].path, Some(Path::from("a/0")));

        assert!(parse_error_objects(b"{\"message\":").is_err());
    }
}
