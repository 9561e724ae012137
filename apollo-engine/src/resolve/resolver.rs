use std::collections::HashMap;
use std::sync::Arc;

use bytes::BufMut;
use bytes::Bytes;
use bytes::BytesMut;
use futures::future::join_all;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::Serialize;
use serde_json_bytes::Value;
use tokio::sync::mpsc;
use tracing::Instrument;

use crate::configuration::ResolverConfiguration;
use crate::error::FetchError;
use crate::error::ResolveError;
use crate::graphql::Error;
use crate::json_ext::Path;
use crate::json_ext::ValueExt;
use crate::resolve::single_flight::SingleFlight;
use crate::resolve::Array;
use crate::resolve::BufPair;
use crate::resolve::BufPairPool;
use crate::resolve::Fetch;
use crate::resolve::GraphQLResponse;
use crate::resolve::GraphQLSubscription;
use crate::resolve::Node;
use crate::resolve::Object;
use crate::resolve::Scalar;
use crate::resolve::SingleFetch;
use crate::resolve::TriggerManager;
use crate::Context;

pub const EXECUTE_SPAN_NAME: &str = "execute";
pub const FETCH_SPAN_NAME: &str = "fetch";
pub const SUBSCRIPTION_EVENT_SPAN_NAME: &str = "subscription_event";

pub const NON_NULLABLE_FIELD_MESSAGE: &str = "Cannot return null for non-nullable field";

/// Executes response plans.
///
/// A resolver is shared by all requests: it owns the buffer pool, the single-flight table and
/// the registered trigger managers. Plans are only read.
pub struct Resolver {
    configuration: ResolverConfiguration,
    single_flight: SingleFlight,
    pool: BufPairPool,
    trigger_managers: HashMap<String, Arc<dyn TriggerManager>>,
}

impl Default for Resolver {
    fn default() -> Self {
        Self::new(ResolverConfiguration::default())
    }
}

impl Resolver {
    pub fn new(configuration: ResolverConfiguration) -> Self {
        Self {
            pool: BufPairPool::new(configuration.pool_size),
            single_flight: SingleFlight::default(),
            trigger_managers: HashMap::new(),
            configuration,
        }
    }

    /// Registers a trigger manager under its id, replacing any manager with the same id.
    pub fn with_trigger_manager(mut self, manager: Arc<dyn TriggerManager>) -> Self {
        self.trigger_managers
            .insert(manager.id().to_string(), manager);
        self
    }

    /// Resolves `response` into a `{"data":...,"errors":[...]}` document.
    ///
    /// `data` is the root value: `None` for queries and mutations, the event payload for
    /// subscriptions. Upstream failures end up in `errors`; only plan defects return an error.
    pub async fn resolve_graphql_response(
        &self,
        context: &Context,
        response: &GraphQLResponse,
        data: Option<Value>,
    ) -> Result<Bytes, ResolveError> {
        let resolution = Resolution {
            resolver: self,
            context,
        };
        let data = data.unwrap_or_default();
        let mut out = BytesMut::with_capacity(1024);
        let mut errors = Vec::new();

        out.put_slice(b"{\"data\":");
        let start = out.len();
        match resolution
            .resolve_node(&response.data, &data, &Path::empty(), &mut out, &mut errors)
            .instrument(tracing::info_span!(EXECUTE_SPAN_NAME))
            .await
        {
            Ok(()) => {}
            Err(Failure::Null) => {
                out.truncate(start);
                out.put_slice(b"null");
            }
            Err(Failure::Fatal(err)) => return Err(err),
        }
        if !errors.is_empty() {
            out.put_slice(b",\"errors\":");
            write_json(&mut out, &errors);
        }
        out.put_u8(b'}');
        Ok(out.freeze())
    }

    /// Drives a subscription: one document is sent on `sender` per event.
    ///
    /// Returns when the event stream closes, when the receiving side of `sender` is dropped or
    /// when the context is cancelled.
    pub async fn resolve_graphql_subscription(
        &self,
        context: &Context,
        subscription: &GraphQLSubscription,
        sender: mpsc::Sender<Bytes>,
    ) -> Result<(), ResolveError> {
        let manager_id = &subscription.trigger.manager_id;
        let manager = self
            .trigger_managers
            .get(manager_id)
            .ok_or_else(|| ResolveError::UnknownTriggerManager(manager_id.clone()))?;

        let mut input = BytesMut::new();
        subscription
            .trigger
            .input
            .render(context, &Value::Null, &mut input)
            .map_err(ResolveError::Trigger)?;
        let mut trigger = manager
            .register(context, input.freeze())
            .await
            .map_err(ResolveError::Trigger)?;
        tracing::trace!(manager = %manager_id, "subscription started");

        loop {
            tokio::select! {
                biased;
                _ = context.cancellation().cancelled() => {
                    tracing::trace!("subscription cancelled");
                    break;
                }
                _ = sender.closed() => {
                    tracing::trace!("subscription receiver dropped");
                    break;
                }
                event = trigger.next() => match event {
                    Some(payload) => {
                        let document = self
                            .resolve_event(context, subscription, &payload)
                            .instrument(tracing::info_span!(SUBSCRIPTION_EVENT_SPAN_NAME))
                            .await?;
                        if sender.send(document).await.is_err() {
                            break;
                        }
                    }
                    None => {
                        tracing::trace!("subscription stream closed");
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    async fn resolve_event(
        &self,
        context: &Context,
        subscription: &GraphQLSubscription,
        payload: &[u8],
    ) -> Result<Bytes, ResolveError> {
        let context = context.for_event();
        match serde_json::from_slice::<Value>(payload) {
            Ok(data) => {
                self.resolve_graphql_response(&context, &subscription.response, Some(data))
                    .await
            }
            Err(err) => {
                let error = FetchError::MalformedResponse {
                    reason: err.to_string(),
                };
                failfast_error!(error = %error, "subscription event is not valid JSON");
                let mut out = BytesMut::from(&b"{\"data\":null,\"errors\":"[..]);
                write_json(&mut out, &[error.to_graphql_error(None)]);
                out.put_u8(b'}');
                Ok(out.freeze())
            }
        }
    }
}

/// Why a node could not be written.
enum Failure {
    /// The value is null but the node is not nullable; the error is already recorded.
    Null,
    Fatal(ResolveError),
}

type Resolved = Result<(), Failure>;

#[derive(Clone, Copy)]
enum ScalarKind {
    String,
    Integer,
    Float,
    Boolean,
}

impl ScalarKind {
    fn accepts(self, value: &Value) -> bool {
        match self {
            ScalarKind::String => value.is_string(),
            ScalarKind::Integer => value.is_i64() || value.is_u64(),
            ScalarKind::Float => value.is_number(),
            ScalarKind::Boolean => value.is_boolean(),
        }
    }

    fn name(self) -> &'static str {
        match self {
            ScalarKind::String => "String",
            ScalarKind::Integer => "Int",
            ScalarKind::Float => "Float",
            ScalarKind::Boolean => "Boolean",
        }
    }
}

/// The state of one resolution.
struct Resolution<'a> {
    resolver: &'a Resolver,
    context: &'a Context,
}

impl Resolution<'_> {
    fn resolve_node<'b>(
        &'b self,
        node: &'b Node,
        data: &'b Value,
        path: &'b Path,
        out: &'b mut BytesMut,
        errors: &'b mut Vec<Error>,
    ) -> BoxFuture<'b, Resolved> {
        match node {
            Node::Object(object) => self.resolve_object(object, data, path, out, errors).boxed(),
            Node::Array(array) => self.resolve_array(array, data, path, out, errors).boxed(),
            Node::String(scalar) => {
                let resolved =
                    self.resolve_scalar(ScalarKind::String, scalar, data, path, out, errors);
                futures::future::ready(resolved).boxed()
            }
            Node::Integer(scalar) => {
                let resolved =
                    self.resolve_scalar(ScalarKind::Integer, scalar, data, path, out, errors);
                futures::future::ready(resolved).boxed()
            }
            Node::Float(scalar) => {
                let resolved =
                    self.resolve_scalar(ScalarKind::Float, scalar, data, path, out, errors);
                futures::future::ready(resolved).boxed()
            }
            Node::Boolean(scalar) => {
                let resolved =
                    self.resolve_scalar(ScalarKind::Boolean, scalar, data, path, out, errors);
                futures::future::ready(resolved).boxed()
            }
            Node::Null => {
                out.put_slice(b"null");
                futures::future::ready(Ok(())).boxed()
            }
            Node::EmptyObject => {
                out.put_slice(b"{}");
                futures::future::ready(Ok(())).boxed()
            }
            Node::StaticString(value) => {
                write_json(out, value.as_str());
                futures::future::ready(Ok(())).boxed()
            }
        }
    }

    async fn resolve_object(
        &self,
        object: &Object,
        data: &Value,
        path: &Path,
        out: &mut BytesMut,
        errors: &mut Vec<Error>,
    ) -> Resolved {
        let selected = if object.path.is_empty() {
            Some(data)
        } else {
            data.get_path(&object.path)
        };
        let value = match selected {
            // the root has no value of its own before its fetch ran
            Some(value) if path.is_empty() && object.path.is_empty() => value,
            Some(value) if value.is_object() => value,
            Some(Value::Null) | None => return null_or_bubble(object.nullable, path, out, errors),
            Some(_) => return mismatch(object.nullable, "Object", path, out, errors),
        };

        let buffers = match &object.fetch {
            Some(fetch) => self.execute_fetch(fetch, value, errors).await,
            None => HashMap::new(),
        };

        let start = out.len();
        out.put_u8(b'{');
        let mut written = 0;
        for field in &object.fields {
            let source = match field.buffer_id {
                Some(buffer_id) => match buffers.get(&buffer_id) {
                    Some(buffer) => buffer,
                    None => {
                        debug_assert!(
                            false,
                            "field '{}' references buffer {buffer_id} which no fetch produced",
                            field.name
                        );
                        return Err(Failure::Fatal(ResolveError::UnknownBuffer(buffer_id)));
                    }
                },
                None => value,
            };
            if field
                .skip
                .as_ref()
                .is_some_and(|skip| skip.applies(self.context, source))
            {
                continue;
            }
            if let Some(type_name) = &field.on_type_name {
                if source.type_name() != Some(type_name.as_str()) {
                    continue;
                }
            }

            if written > 0 {
                out.put_u8(b',');
            }
            write_json(out, field.name.as_str());
            out.put_u8(b':');
            let field_path = path.join_key(field.name.as_str());
            match self
                .resolve_node(&field.value, source, &field_path, out, errors)
                .await
            {
                Ok(()) => written += 1,
                Err(failure) => {
                    out.truncate(start);
                    return after_failure(object.nullable, failure, out);
                }
            }
        }

        if written == 0 {
            out.truncate(start);
            return null_or_bubble(object.nullable, path, out, errors);
        }
        out.put_u8(b'}');
        Ok(())
    }

    async fn resolve_array(
        &self,
        array: &Array,
        data: &Value,
        path: &Path,
        out: &mut BytesMut,
        errors: &mut Vec<Error>,
    ) -> Resolved {
        let items = match data.get_path(&array.path) {
            Some(Value::Array(items)) => items,
            Some(Value::Null) | None => return null_or_bubble(array.nullable, path, out, errors),
            Some(_) => return mismatch(array.nullable, "List", path, out, errors),
        };

        let start = out.len();
        out.put_u8(b'[');
        if array.resolve_asynchronous && items.len() > 1 {
            let item = array.item.as_ref();
            let resolved = join_all(items.iter().enumerate().map(|(index, value)| async move {
                let item_path = path.join_index(index);
                let mut item_out = BytesMut::new();
                let mut item_errors = Vec::new();
                let resolved = self
                    .resolve_node(item, value, &item_path, &mut item_out, &mut item_errors)
                    .await;
                (resolved, item_out, item_errors)
            }))
            .await;

            let mut failure = None;
            for (index, (resolved, item_out, item_errors)) in resolved.into_iter().enumerate() {
                // items after the first failure are discarded with their errors
                if failure.is_none() {
                    errors.extend(item_errors);
                }
                match (resolved, &failure) {
                    (Ok(()), None) => {
                        if index > 0 {
                            out.put_u8(b',');
                        }
                        out.put_slice(&item_out);
                    }
                    (Err(err), None) => failure = Some(err),
                    (_, Some(_)) => {}
                }
            }
            if let Some(failure) = failure {
                out.truncate(start);
                return after_failure(array.nullable, failure, out);
            }
        } else {
            for (index, value) in items.iter().enumerate() {
                if index > 0 {
                    out.put_u8(b',');
                }
                let item_path = path.join_index(index);
                if let Err(failure) = self
                    .resolve_node(&array.item, value, &item_path, out, errors)
                    .await
                {
                    out.truncate(start);
                    return after_failure(array.nullable, failure, out);
                }
            }
        }
        out.put_u8(b']');
        Ok(())
    }

    fn resolve_scalar(
        &self,
        kind: ScalarKind,
        scalar: &Scalar,
        data: &Value,
        path: &Path,
        out: &mut BytesMut,
        errors: &mut Vec<Error>,
    ) -> Resolved {
        match data.get_path(&scalar.path) {
            Some(Value::Null) | None => null_or_bubble(scalar.nullable, path, out, errors),
            Some(value) if kind.accepts(value) => {
                write_json(out, value);
                Ok(())
            }
            Some(_) => mismatch(scalar.nullable, kind.name(), path, out, errors),
        }
    }

    /// Runs the fetch of an object and returns the data of its buffers.
    ///
    /// Buffer errors are recorded immediately; a buffer without valid data reads as `null`.
    async fn execute_fetch(
        &self,
        fetch: &Fetch,
        parent: &Value,
        errors: &mut Vec<Error>,
    ) -> HashMap<usize, Value> {
        let loaded = self.load_fetch(fetch, parent).await;
        let mut buffers = HashMap::with_capacity(loaded.len());
        for (buffer_id, pair) in loaded {
            errors.extend(pair.graphql_errors());
            let value = if pair.has_data() {
                serde_json::from_slice(&pair.data).unwrap_or_else(|err| {
                    let error = FetchError::MalformedResponse {
                        reason: err.to_string(),
                    };
                    failfast_error!(buffer_id, error = %error, "data source wrote invalid JSON");
                    errors.push(error.to_graphql_error(None));
                    Value::Null
                })
            } else {
                Value::Null
            };
            self.resolver.pool.put(pair);
            buffers.insert(buffer_id, value);
        }
        buffers
    }

    fn load_fetch<'b>(
        &'b self,
        fetch: &'b Fetch,
        parent: &'b Value,
    ) -> BoxFuture<'b, Vec<(usize, BufPair)>> {
        async move {
            match fetch {
                Fetch::Single(single) => {
                    let pair = self
                        .load_single(single, parent)
                        .instrument(tracing::info_span!(
                            FETCH_SPAN_NAME,
                            buffer_id = single.buffer_id
                        ))
                        .await;
                    vec![(single.buffer_id, pair)]
                }
                Fetch::Parallel(parallel) => join_all(
                    parallel
                        .fetches
                        .iter()
                        .map(|fetch| self.load_fetch(fetch, parent)),
                )
                .await
                .into_iter()
                .flatten()
                .collect(),
                Fetch::Serial(serial) => {
                    let mut current = parent.clone();
                    let mut loaded = Vec::new();
                    for fetch in &serial.fetches {
                        let pairs = self.load_fetch(fetch, &current).await;
                        for (_, pair) in &pairs {
                            if let Ok(value) = serde_json::from_slice::<Value>(&pair.data) {
                                current.deep_merge(value);
                            }
                        }
                        loaded.extend(pairs);
                    }
                    loaded
                }
            }
        }
        .boxed()
    }

    async fn load_single(&self, fetch: &SingleFetch, parent: &Value) -> BufPair {
        let mut pair = self.resolver.pool.get();
        let mut input = BytesMut::new();
        if let Err(err) = fetch.input.render(self.context, parent, &mut input) {
            failfast_debug!(error = %err, "could not render fetch input");
            pair.write_graphql_error(&err.to_graphql_error(None));
            return pair;
        }

        let result = tokio::select! {
            biased;
            _ = self.context.cancellation().cancelled() => Err(FetchError::Cancelled),
            result = self.load(fetch, input.freeze(), &mut pair) => result,
        };
        if let Err(err) = result {
            failfast_error!(error = %err, "fetch failed");
            pair.data.clear();
            pair.write_graphql_error(&err.to_graphql_error(None));
        }
        pair
    }

    async fn load(
        &self,
        fetch: &SingleFetch,
        input: Bytes,
        pair: &mut BufPair,
    ) -> Result<(), FetchError> {
        if self.resolver.configuration.single_flight && !fetch.disallow_single_flight {
            self.resolver
                .single_flight
                .load(self.context, fetch.data_source.as_ref(), input, pair)
                .await
        } else {
            fetch.data_source.load(self.context, &input, pair).await
        }
    }
}

/// Writes `null` for nullable nodes, records a non-nullable error and bubbles otherwise.
fn null_or_bubble(
    nullable: bool,
    path: &Path,
    out: &mut BytesMut,
    errors: &mut Vec<Error>,
) -> Resolved {
    if nullable {
        out.put_slice(b"null");
        return Ok(());
    }
    errors.push(field_error(NON_NULLABLE_FIELD_MESSAGE.to_string(), path));
    Err(Failure::Null)
}

fn mismatch(
    nullable: bool,
    expected: &str,
    path: &Path,
    out: &mut BytesMut,
    errors: &mut Vec<Error>,
) -> Resolved {
    errors.push(field_error(
        format!("Invalid value for {expected} field"),
        path,
    ));
    after_failure(nullable, Failure::Null, out)
}

/// Handles the failure of a child: nullable nodes absorb it.
fn after_failure(nullable: bool, failure: Failure, out: &mut BytesMut) -> Resolved {
    match failure {
        Failure::Null if nullable => {
            out.put_slice(b"null");
            Ok(())
        }
        failure => Err(failure),
    }
}

fn field_error(message: String, path: &Path) -> Error {
    Error::builder()
        .message(message)
        .and_path((!path.is_empty()).then(|| path.clone()))
        .build()
}

fn write_json<T: Serialize + ?Sized>(out: &mut BytesMut, value: &T) {
    if let Err(err) = serde_json::to_writer((&mut *out).writer(), value) {
        failfast_error!(error = %err, "could not serialize response value");
    }
}
