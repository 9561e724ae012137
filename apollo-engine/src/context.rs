//! Provide a [`Context`] for a single resolution.
//!
//! A context is created per top-level request or subscription event and is never shared
//! mutably: it carries the operation variables, the request headers and the cancellation token
//! every load races against.

use bytes::Bytes;
use http::HeaderMap;
use serde_json_bytes::Value;
use tokio_util::sync::CancellationToken;

/// Context for a resolution.
#[derive(Clone, Debug, Default)]
pub struct Context {
    variables: Value,
    raw_variables: Bytes,
    headers: HeaderMap,
    cancellation: CancellationToken,
}

#[buildstructor::buildstructor]
impl Context {
    /// Returns a builder for a [`Context`].
    ///
    /// Every part is optional: variables default to `null`, headers to an empty map and the
    /// cancellation token to a fresh one.
    #[builder(visibility = "pub")]
    fn new(
        variables: Option<Value>,
        headers: Option<HeaderMap>,
        cancellation: Option<CancellationToken>,
    ) -> Self {
        let variables = variables.unwrap_or_default();
        let raw_variables = serde_json::to_vec(&variables)
            .map(Bytes::from)
            .unwrap_or_default();
        Context {
            variables,
            raw_variables,
            headers: headers.unwrap_or_default(),
            cancellation: cancellation.unwrap_or_default(),
        }
    }
}

impl Context {
    /// Creates a context from the raw JSON of the operation variables.
    pub fn from_variables(raw: Bytes) -> Result<Self, serde_json::Error> {
        let variables = if raw.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&raw)?
        };
        Ok(Context {
            variables,
            raw_variables: raw,
            ..Default::default()
        })
    }

    /// The parsed operation variables.
    pub fn variables(&self) -> &Value {
        &self.variables
    }

    /// The operation variables as received.
    pub fn raw_variables(&self) -> &Bytes {
        &self.raw_variables
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// Cancels every pending and future load of this context.
    pub fn cancel(&self) {
        self.cancellation.cancel()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// A context for one subscription event.
    ///
    /// It shares variables and headers, and is cancelled along with `self`.
    pub(crate) fn for_event(&self) -> Context {
        Context {
            cancellation: self.cancellation.child_token(),
            ..self.clone()
        }
    }
}
