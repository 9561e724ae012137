use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use serde_json_bytes::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::*;
use crate::configuration::ResolverConfiguration;
use crate::error::ResolveError;
use crate::graphql;

/// Answers every load with a fixed payload after an optional delay.
struct FakeSource {
    id: &'static str,
    data: &'static str,
    errors: Option<&'static str>,
    delay: Duration,
    loads: AtomicUsize,
    inputs: Mutex<Vec<String>>,
}

impl FakeSource {
    fn new(id: &'static str, data: &'static str) -> Self {
        Self {
            id,
            data,
            errors: None,
            delay: Duration::ZERO,
            loads: AtomicUsize::new(0),
            inputs: Mutex::new(Vec::new()),
        }
    }

    fn with_errors(mut self, errors: &'static str) -> Self {
        self.errors = Some(errors);
        self
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    fn inputs(&self) -> Vec<String> {
        self.inputs.lock().clone()
    }
}

#[async_trait]
impl DataSource for FakeSource {
    fn unique_identifier(&self) -> Bytes {
        Bytes::from_static(self.id.as_bytes())
    }

    async fn load(
        &self,
        _context: &Context,
        input: &[u8],
        out: &mut BufPair,
    ) -> Result<(), FetchError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        self.inputs
            .lock()
            .push(String::from_utf8_lossy(input).into_owned());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        out.data.extend_from_slice(self.data.as_bytes());
        if let Some(errors) = self.errors {
            out.errors.extend_from_slice(errors.as_bytes());
        }
        Ok(())
    }
}

fn single(buffer_id: usize, source: &Arc<FakeSource>, input: &str) -> Fetch {
    let data_source: Arc<dyn DataSource> = source.clone();
    SingleFetch::new(buffer_id, data_source, input, Vec::new()).into()
}

fn string(path: &str) -> Node {
    Node::String(Scalar::at([path]))
}

fn response(root: Object) -> GraphQLResponse {
    GraphQLResponse { data: root.into() }
}

async fn resolve(resolver: &Resolver, context: &Context, plan: &GraphQLResponse) -> String {
    let bytes = resolver
        .resolve_graphql_response(context, plan, None)
        .await
        .expect("resolution must succeed");
    String::from_utf8(bytes.to_vec()).expect("output must be UTF-8")
}

#[tokio::test]
async fn resolves_a_single_fetch() {
    let source = Arc::new(FakeSource::new("users", r#"{"id":"1","name":"Jens"}"#));
    let plan = response(
        Object::new()
            .fetch(single(0, &source, "{}"))
            .field(Field::new("id", string("id")).buffer(0))
            .field(Field::new("name", string("name")).buffer(0)),
    );

    let output = resolve(&Resolver::default(), &Context::default(), &plan).await;
    assert_eq!(output, r#"{"data":{"id":"1","name":"Jens"}}"#);
    assert_eq!(source.inputs(), ["{}"]);
}

#[tokio::test]
async fn nested_fetch_reads_parent_fields() {
    let users = Arc::new(FakeSource::new("users", r#"{"id":1,"name":"Jens"}"#));
    let mut pets = MockDataSource::new();
    pets.expect_unique_identifier()
        .returning(|| Bytes::from_static(b"pets"));
    pets.expect_load()
        .withf(|_, input, _| input.to_vec() == br#"{"id":1}"#.to_vec())
        .times(1)
        .returning(|_, _, out| {
            out.data.extend_from_slice(br#"{"name":"Woofie"}"#);
            Ok(())
        });
    let pets: Arc<dyn DataSource> = Arc::new(pets);

    let pet = Object::new()
        .fetch(SingleFetch::new(1, pets, r#"{"id":$$0$$}"#, vec![Variable::object(["id"])]).into())
        .field(Field::new("name", string("name")).buffer(1));
    let plan = response(
        Object::new()
            .fetch(single(0, &users, "{}"))
            .field(Field::new("id", Node::Integer(Scalar::at(["id"]))).buffer(0))
            .field(Field::new("name", string("name")).buffer(0))
            .field(Field::new("pet", pet.into()).buffer(0)),
    );

    let output = resolve(&Resolver::default(), &Context::default(), &plan).await;
    assert_eq!(
        output,
        r#"{"data":{"id":1,"name":"Jens","pet":{"name":"Woofie"}}}"#
    );
}

#[tokio::test]
async fn upstream_errors_are_forwarded() {
    let source = Arc::new(FakeSource::new("users", "").with_errors(r#"{"message":"errorMessage"}"#));
    let plan = response(
        Object::new()
            .fetch(single(0, &source, "{}"))
            .field(Field::new("name", Node::String(Scalar::at(["name"]).nullable())).buffer(0)),
    );

    let output = resolve(&Resolver::default(), &Context::default(), &plan).await;
    assert_eq!(
        output,
        r#"{"data":{"name":null},"errors":[{"message":"errorMessage"}]}"#
    );
}

#[tokio::test(start_paused = true)]
async fn field_order_follows_the_plan_whatever_the_latency() {
    let permutations = [
        [10, 20, 30],
        [30, 20, 10],
        [20, 10, 30],
        [30, 10, 20],
    ];
    let mut outputs = Vec::new();
    for delays in permutations {
        let sources: Vec<Arc<FakeSource>> = [
            ("f1", r#"{"value":"one"}"#),
            ("f2", r#"{"value":"two"}"#),
            ("f3", r#"{"value":"three"}"#),
        ]
        .into_iter()
        .zip(delays)
        .map(|((id, data), delay)| {
            Arc::new(FakeSource::new(id, data).with_delay(Duration::from_millis(delay)))
        })
        .collect();

        let fetch = single(0, &sources[0], "{}")
            .parallel(single(1, &sources[1], "{}"))
            .parallel(single(2, &sources[2], "{}"));
        let plan = response(
            Object::new()
                .fetch(fetch)
                .field(Field::new("f1", string("value")).buffer(0))
                .field(Field::new("f2", string("value")).buffer(1))
                .field(Field::new("f3", string("value")).buffer(2)),
        );
        outputs.push(resolve(&Resolver::default(), &Context::default(), &plan).await);
    }

    for output in &outputs {
        assert_eq!(
            output,
            r#"{"data":{"f1":"one","f2":"two","f3":"three"}}"#
        );
    }
}

#[tokio::test]
async fn nullable_object_absorbs_a_missing_non_nullable_field() {
    let source = Arc::new(FakeSource::new(
        "users",
        r#"{"user":{"name":"Jens","age":null}}"#,
    ));
    let user = Object::new()
        .at(["user"])
        .nullable()
        .field(Field::new("name", string("name")))
        .field(Field::new("age", Node::Integer(Scalar::at(["age"]))))
        .field(Field::new("email", string("email")));
    let plan = response(
        Object::new()
            .fetch(single(0, &source, "{}"))
            .field(Field::new("user", user.into()).buffer(0)),
    );

    let output = resolve(&Resolver::default(), &Context::default(), &plan).await;
    assert_eq!(
        output,
        r#"{"data":{"user":null},"errors":[{"message":"Cannot return null for non-nullable field","path":["user","age"]}]}"#
    );
}

#[tokio::test]
async fn non_nullable_chain_nulls_the_nearest_nullable_ancestor() {
    let source = Arc::new(FakeSource::new(
        "org",
        r#"{"org":{"name":"Apollo","team":{"lead":{"name":null}}}}"#,
    ));
    let lead = Object::new()
        .at(["lead"])
        .field(Field::new("name", string("name")));
    let team = Object::new()
        .at(["team"])
        .field(Field::new("lead", lead.into()));
    let org = Object::new()
        .at(["org"])
        .nullable()
        .field(Field::new("team", team.into()));
    let plan = response(
        Object::new()
            .fetch(single(0, &source, "{}"))
            .field(Field::new("org", org.into()).buffer(0))
            .field(Field::new("version", Node::Null)),
    );

    let output = resolve(&Resolver::default(), &Context::default(), &plan).await;
    assert_eq!(
        output,
        r#"{"data":{"org":null,"version":null},"errors":[{"message":"Cannot return null for non-nullable field","path":["org","team","lead","name"]}]}"#
    );
}

#[tokio::test]
async fn non_nullable_chain_to_the_root_nulls_data() {
    let source = Arc::new(FakeSource::new("org", r#"{"org":{"team":null}}"#));
    let team = Object::new()
        .at(["team"])
        .field(Field::new("name", string("name")));
    let org = Object::new()
        .at(["org"])
        .field(Field::new("team", team.into()));
    let plan = response(
        Object::new()
            .fetch(single(0, &source, "{}"))
            .field(Field::new("org", org.into()).buffer(0)),
    );

    let output = resolve(&Resolver::default(), &Context::default(), &plan).await;
    assert_eq!(
        output,
        r#"{"data":null,"errors":[{"message":"Cannot return null for non-nullable field","path":["org","team"]}]}"#
    );
}

#[tokio::test]
async fn invalid_scalar_values_are_reported() {
    let source = Arc::new(FakeSource::new(
        "stats",
        r#"{"count":"many","ratio":1,"enabled":"yes"}"#,
    ));
    let plan = response(
        Object::new()
            .fetch(single(0, &source, "{}"))
            .field(Field::new("count", Node::Integer(Scalar::at(["count"]).nullable())).buffer(0))
            .field(Field::new("ratio", Node::Float(Scalar::at(["ratio"]))).buffer(0))
            .field(
                Field::new("enabled", Node::Boolean(Scalar::at(["enabled"]).nullable())).buffer(0),
            ),
    );

    let output = resolve(&Resolver::default(), &Context::default(), &plan).await;
    let response = graphql::Response::from_bytes(output.as_bytes()).unwrap();
    assert_eq!(
        response.data,
        Some(json!({"count": null, "ratio": 1, "enabled": null}))
    );
    let messages: Vec<_> = response.errors.iter().map(|e| e.message.as_str()).collect();
    assert_eq!(
        messages,
        ["Invalid value for Int field", "Invalid value for Boolean field"]
    );
}

#[tokio::test]
async fn type_conditional_fields_are_omitted_on_other_types() {
    let source = Arc::new(FakeSource::new(
        "pets",
        r#"{"pets":[{"__typename":"Dog","name":"Rex","woof":"loud"},{"__typename":"Cat","name":"Tom","meow":"soft"}]}"#,
    ));
    let pet = Object::new()
        .field(Field::new("name", string("name")))
        .field(Field::new("woof", string("woof")).on_type_name("Dog"))
        .field(Field::new("meow", string("meow")).on_type_name("Cat"));
    let plan = response(
        Object::new()
            .fetch(single(0, &source, "{}"))
            .field(Field::new("pets", Array::of(pet.into()).at(["pets"]).into()).buffer(0)),
    );

    let output = resolve(&Resolver::default(), &Context::default(), &plan).await;
    assert_eq!(
        output,
        r#"{"data":{"pets":[{"name":"Rex","woof":"loud"},{"name":"Tom","meow":"soft"}]}}"#
    );
}

#[tokio::test]
async fn skip_conditions_read_operation_variables() {
    let source = Arc::new(FakeSource::new("users", r#"{"id":"1","name":"Jens"}"#));
    let skip_name = SkipCondition::Variable {
        path: vec!["withName".to_string()],
        skip_if: false,
    };
    let plan = response(
        Object::new()
            .fetch(single(0, &source, "{}"))
            .field(Field::new("id", string("id")).buffer(0))
            .field(Field::new("name", string("name")).buffer(0).skip(skip_name)),
    );
    let resolver = Resolver::default();

    let with_name = Context::builder()
        .variables(json!({"withName": true}))
        .build();
    assert_eq!(
        resolve(&resolver, &with_name, &plan).await,
        r#"{"data":{"id":"1","name":"Jens"}}"#
    );
    let without_name = Context::builder()
        .variables(json!({"withName": false}))
        .build();
    assert_eq!(
        resolve(&resolver, &without_name, &plan).await,
        r#"{"data":{"id":"1"}}"#
    );
}

#[tokio::test(start_paused = true)]
async fn identical_concurrent_fetches_load_once() {
    let source = Arc::new(
        FakeSource::new("users", r#"{"id":"1","name":"Jens"}"#)
            .with_delay(Duration::from_millis(50)),
    );
    let plan = response(
        Object::new()
            .fetch(single(0, &source, r#"{"query":"{me{id name}}"}"#))
            .field(Field::new("id", string("id")).buffer(0))
            .field(Field::new("name", string("name")).buffer(0)),
    );
    let resolver = Resolver::default();
    let context = Context::default();

    let outputs =
        futures::future::join_all((0..5).map(|_| resolve(&resolver, &context, &plan))).await;
    assert_eq!(source.loads(), 1);
    for output in outputs {
        assert_eq!(output, r#"{"data":{"id":"1","name":"Jens"}}"#);
    }
}

#[tokio::test(start_paused = true)]
async fn disallowed_single_flight_loads_every_time() {
    let source = Arc::new(
        FakeSource::new("users", r#"{"ok":true}"#).with_delay(Duration::from_millis(50)),
    );
    let data_source: Arc<dyn DataSource> = source.clone();
    let fetch = SingleFetch::new(0, data_source, r#"{"mutation":1}"#, Vec::new())
        .disallow_single_flight();
    let plan = response(
        Object::new()
            .fetch(fetch.into())
            .field(Field::new("ok", Node::Boolean(Scalar::at(["ok"]))).buffer(0)),
    );
    let resolver = Resolver::default();
    let context = Context::default();

    futures::future::join_all((0..3).map(|_| resolve(&resolver, &context, &plan))).await;
    assert_eq!(source.loads(), 3);
}

#[tokio::test(start_paused = true)]
async fn disabling_single_flight_keeps_the_output() {
    let source = Arc::new(
        FakeSource::new("users", r#"{"id":"1"}"#).with_delay(Duration::from_millis(5)),
    );
    let plan = response(
        Object::new()
            .fetch(single(0, &source, "{}"))
            .field(Field::new("id", string("id")).buffer(0)),
    );
    let deduplicated = Resolver::default();
    let direct = Resolver::new(ResolverConfiguration {
        single_flight: false,
        ..Default::default()
    });
    let context = Context::default();

    let (a, b) = tokio::join!(
        resolve(&deduplicated, &context, &plan),
        resolve(&direct, &context, &plan)
    );
    assert_eq!(a, b);
}

#[tokio::test]
async fn empty_lists_stay_empty() {
    let source = Arc::new(FakeSource::new("pets", r#"{"pets":[]}"#));
    let pet = Object::new().field(Field::new("name", string("name")));
    let plan = response(
        Object::new()
            .fetch(single(0, &source, "{}"))
            .field(Field::new("pets", Array::of(pet.into()).at(["pets"]).into()).buffer(0)),
    );

    let output = resolve(&Resolver::default(), &Context::default(), &plan).await;
    assert_eq!(output, r#"{"data":{"pets":[]}}"#);
}

#[tokio::test(start_paused = true)]
async fn asynchronous_arrays_keep_the_source_order() {
    let users = Arc::new(FakeSource::new("users", r#"{"users":[{"id":3},{"id":1},{"id":2}]}"#));
    let mut details = MockDataSource::new();
    details
        .expect_unique_identifier()
        .returning(|| Bytes::from_static(b"details"));
    details.expect_load().times(3).returning(|_, input, out| {
        // echo the id back as the name
        let id: serde_json::Value = serde_json::from_slice(input).unwrap();
        out.data
            .extend_from_slice(format!(r#"{{"name":"user-{}"}}"#, id["id"]).as_bytes());
        Ok(())
    });
    let details: Arc<dyn DataSource> = Arc::new(details);

    let user = Object::new()
        .fetch(SingleFetch::new(1, details, r#"{"id":$$0$$}"#, vec![Variable::object(["id"])]).into())
        .field(Field::new("id", Node::Integer(Scalar::at(["id"]))))
        .field(Field::new("name", string("name")).buffer(1));
    let plan = response(
        Object::new()
            .fetch(single(0, &users, "{}"))
            .field(
                Field::new("users", Array::of(user.into()).at(["users"]).asynchronous().into())
                    .buffer(0),
            ),
    );

    let output = resolve(&Resolver::default(), &Context::default(), &plan).await;
    assert_eq!(
        output,
        r#"{"data":{"users":[{"id":3,"name":"user-3"},{"id":1,"name":"user-1"},{"id":2,"name":"user-2"}]}}"#
    );
}

#[tokio::test]
async fn failing_array_item_nulls_a_nullable_list() {
    let source = Arc::new(FakeSource::new("tags", r#"{"tags":["a",null,"c"],"ids":[1,null]}"#));
    let plan = response(
        Object::new()
            .fetch(single(0, &source, "{}"))
            .field(
                Field::new("tags", Array::of(Node::String(Scalar::default())).at(["tags"]).nullable().into())
                    .buffer(0),
            )
            .field(
                Field::new(
                    "ids",
                    Array::of(Node::Integer(Scalar::default().nullable()))
                        .at(["ids"])
                        .into(),
                )
                .buffer(0),
            ),
    );

    let output = resolve(&Resolver::default(), &Context::default(), &plan).await;
    assert_eq!(
        output,
        r#"{"data":{"tags":null,"ids":[1,null]},"errors":[{"message":"Cannot return null for non-nullable field","path":["tags",1]}]}"#
    );
}

#[tokio::test]
async fn null_list_items_stay_null() {
    let source = Arc::new(FakeSource::new(
        "pets",
        r#"{"pets":[null,{"id":1,"name":"Woofie"}]}"#,
    ));
    let owners = Arc::new(FakeSource::new("owners", r#"{"owner":"Jens"}"#));
    for asynchronous in [false, true] {
        let owners_source: Arc<dyn DataSource> = owners.clone();
        let pet = Object::new()
            .nullable()
            .fetch(
                SingleFetch::new(1, owners_source, r#"{"pet":$$0$$}"#, vec![Variable::object(["id"])])
                    .into(),
            )
            .field(Field::new("name", string("name")))
            .field(Field::new("owner", string("owner")).buffer(1));
        let mut pets = Array::of(pet.into()).at(["pets"]);
        if asynchronous {
            pets = pets.asynchronous();
        }
        let plan = response(
            Object::new()
                .fetch(single(0, &source, "{}"))
                .field(Field::new("pets", pets.into()).buffer(0)),
        );

        let output = resolve(&Resolver::default(), &Context::default(), &plan).await;
        assert_eq!(
            output,
            r#"{"data":{"pets":[null,{"name":"Woofie","owner":"Jens"}]}}"#
        );
    }
    // null items never render their fetch input
    assert_eq!(owners.inputs(), [r#"{"pet":1}"#, r#"{"pet":1}"#]);
}

#[tokio::test]
async fn failing_list_items_report_the_same_errors_in_any_mode() {
    let source = Arc::new(FakeSource::new("tags", r#"{"tags":["a",null,null]}"#));
    for asynchronous in [false, true] {
        let mut tags = Array::of(Node::String(Scalar::default()))
            .at(["tags"])
            .nullable();
        if asynchronous {
            tags = tags.asynchronous();
        }
        let plan = response(
            Object::new()
                .fetch(single(0, &source, "{}"))
                .field(Field::new("tags", tags.into()).buffer(0)),
        );

        let output = resolve(&Resolver::default(), &Context::default(), &plan).await;
        assert_eq!(
            output,
            r#"{"data":{"tags":null},"errors":[{"message":"Cannot return null for non-nullable field","path":["tags",1]}]}"#
        );
    }
}

#[tokio::test]
async fn serial_fetches_see_earlier_buffers() {
    let users = Arc::new(FakeSource::new("users", r#"{"user":{"id":"1"}}"#));
    let mut names = MockDataSource::new();
    names
        .expect_unique_identifier()
        .returning(|| Bytes::from_static(b"names"));
    names
        .expect_load()
        .withf(|_, input, _| input.to_vec() == br#"{"id":"1"}"#.to_vec())
        .times(1)
        .returning(|_, _, out| {
            out.data.extend_from_slice(br#"{"name":"Jens"}"#);
            Ok(())
        });
    let names: Arc<dyn DataSource> = Arc::new(names);

    let fetch = single(0, &users, "{}").serial(
        SingleFetch::new(1, names, r#"{"id":$$0$$}"#, vec![Variable::object(["user", "id"])])
            .into(),
    );
    let plan = response(
        Object::new()
            .fetch(fetch)
            .field(Field::new("id", Node::String(Scalar::at(["user", "id"]))).buffer(0))
            .field(Field::new("name", string("name")).buffer(1)),
    );

    let output = resolve(&Resolver::default(), &Context::default(), &plan).await;
    assert_eq!(output, r#"{"data":{"id":"1","name":"Jens"}}"#);
}

#[tokio::test]
async fn missing_template_variables_abort_only_their_fetch() {
    let users = Arc::new(FakeSource::new("users", r#"{"name":"Jens"}"#));
    let pets = Arc::new(FakeSource::new("pets", r#"{"name":"Woofie"}"#));
    let pets_source: Arc<dyn DataSource> = pets.clone();
    let fetch = single(0, &users, "{}").parallel(
        SingleFetch::new(1, pets_source, r#"{"owner":$$0$$}"#, vec![Variable::context(["owner"])])
            .into(),
    );
    let plan = response(
        Object::new()
            .fetch(fetch)
            .field(Field::new("name", string("name")).buffer(0))
            .field(Field::new("pet", Node::String(Scalar::at(["name"]).nullable())).buffer(1)),
    );

    let output = resolve(&Resolver::default(), &Context::default(), &plan).await;
    assert_eq!(
        output,
        r#"{"data":{"name":"Jens","pet":null},"errors":[{"message":"missing template variable: 'variables.owner'","extensions":{"name":"variables.owner","code":"TEMPLATE_VARIABLE_MISSING"}}]}"#
    );
    assert_eq!(pets.loads(), 0);
}

#[test_log::test(tokio::test(start_paused = true))]
async fn cancelled_loads_become_fetch_errors() {
    let source = Arc::new(
        FakeSource::new("slow", r#"{"name":"Jens"}"#).with_delay(Duration::from_secs(60)),
    );
    let plan = response(
        Object::new()
            .fetch(single(0, &source, "{}"))
            .field(Field::new("name", Node::String(Scalar::at(["name"]).nullable())).buffer(0)),
    );
    let token = CancellationToken::new();
    let context = Context::builder().cancellation(token.clone()).build();
    let resolver = Resolver::default();

    let (output, ()) = tokio::join!(resolve(&resolver, &context, &plan), async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        token.cancel();
    });
    assert_eq!(
        output,
        r#"{"data":{"name":null},"errors":[{"message":"fetch was cancelled","extensions":{"code":"FETCH_CANCELLED"}}]}"#
    );
}

#[tokio::test]
async fn upstream_load_failures_are_recorded() {
    let mut source = MockDataSource::new();
    source
        .expect_unique_identifier()
        .returning(|| Bytes::from_static(b"accounts"));
    source.expect_load().times(1).returning(|_, _, out| {
        out.data.extend_from_slice(b"{\"partial\":");
        Err(FetchError::SubrequestFailed {
            service: "accounts".to_string(),
            reason: "connection refused".to_string(),
        })
    });
    let source: Arc<dyn DataSource> = Arc::new(source);
    let plan = response(
        Object::new()
            .fetch(SingleFetch::new(0, source, "{}", Vec::new()).into())
            .field(Field::new("me", Node::String(Scalar::at(["me"]).nullable())).buffer(0)),
    );

    let output = resolve(&Resolver::default(), &Context::default(), &plan).await;
    let response = graphql::Response::from_bytes(output.as_bytes()).unwrap();
    assert_eq!(response.data, Some(json!({"me": null})));
    assert_eq!(response.errors.len(), 1);
    assert_eq!(
        response.errors[0].message,
        "request to 'accounts' failed: connection refused"
    );
    assert_eq!(
        response.errors[0].extensions.get("code"),
        Some(&json!("SUBREQUEST_FAILED"))
    );
}

#[tokio::test]
async fn errors_written_before_a_failed_load_survive_single_flight() {
    let mut source = MockDataSource::new();
    source
        .expect_unique_identifier()
        .returning(|| Bytes::from_static(b"reviews"));
    source.expect_load().times(2).returning(|_, _, out| {
        out.write_err("upstream said no", Vec::new(), None);
        Err(FetchError::SubrequestFailed {
            service: "reviews".to_string(),
            reason: "500".to_string(),
        })
    });
    let source: Arc<dyn DataSource> = Arc::new(source);
    let plan = response(
        Object::new()
            .fetch(SingleFetch::new(0, source, "{}", Vec::new()).into())
            .field(Field::new("review", Node::String(Scalar::at(["review"]).nullable())).buffer(0)),
    );
    let context = Context::default();
    let deduplicated = resolve(&Resolver::default(), &context, &plan).await;
    let direct = resolve(
        &Resolver::new(ResolverConfiguration {
            single_flight: false,
            ..Default::default()
        }),
        &context,
        &plan,
    )
    .await;

    assert_eq!(deduplicated, direct);
    let response = graphql::Response::from_bytes(deduplicated.as_bytes()).unwrap();
    let messages: Vec<&str> = response
        .errors
        .iter()
        .map(|error| error.message.as_str())
        .collect();
    assert_eq!(
        messages,
        ["upstream said no", "request to 'reviews' failed: 500"]
    );
}

#[cfg(debug_assertions)]
#[tokio::test]
#[should_panic(expected = "which no fetch produced")]
async fn unknown_buffers_are_plan_defects() {
    let source = Arc::new(FakeSource::new("users", r#"{"id":"1"}"#));
    let plan = response(
        Object::new()
            .fetch(single(0, &source, "{}"))
            .field(Field::new("id", string("id")).buffer(7)),
    );
    resolve(&Resolver::default(), &Context::default(), &plan).await;
}

/// Pushes fixed payloads, optionally keeping the stream open afterwards.
struct FakeTriggerManager {
    payloads: Vec<&'static str>,
    keep_open: bool,
    inputs: Mutex<Vec<Bytes>>,
    unregistered: Arc<AtomicBool>,
    open: Mutex<Vec<mpsc::Sender<Bytes>>>,
}

impl FakeTriggerManager {
    fn new(payloads: Vec<&'static str>) -> Self {
        Self {
            payloads,
            keep_open: false,
            inputs: Mutex::new(Vec::new()),
            unregistered: Arc::new(AtomicBool::new(false)),
            open: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl TriggerManager for FakeTriggerManager {
    fn id(&self) -> &str {
        "fake"
    }

    async fn register(&self, _context: &Context, input: Bytes) -> Result<Trigger, FetchError> {
        self.inputs.lock().push(input);
        let (tx, rx) = mpsc::channel(self.payloads.len().max(1));
        for payload in &self.payloads {
            let _ = tx.try_send(Bytes::from_static(payload.as_bytes()));
        }
        if self.keep_open {
            self.open.lock().push(tx);
        }
        let unregistered = self.unregistered.clone();
        Ok(Trigger::new(rx).on_unregister(move || unregistered.store(true, Ordering::SeqCst)))
    }
}

fn counter_subscription() -> GraphQLSubscription {
    let variables = vec![Variable::context(["step"])];
    GraphQLSubscription {
        trigger: GraphQLSubscriptionTrigger {
            manager_id: "fake".to_string(),
            input: InputTemplate::parse(r#"{"step":$$0$$}"#, &variables),
            variables,
        },
        response: response(
            Object::new().field(Field::new("counter", Node::Integer(Scalar::at(["counter"])))),
        ),
    }
}

#[tokio::test]
async fn subscriptions_send_one_document_per_event() {
    let manager = Arc::new(FakeTriggerManager::new(vec![
        r#"{"counter":0}"#,
        r#"{"counter":1}"#,
        r#"{"counter":2}"#,
    ]));
    let resolver = Resolver::default().with_trigger_manager(manager.clone());
    let context = Context::builder().variables(json!({"step": 1})).build();
    let (tx, mut rx) = mpsc::channel(8);

    resolver
        .resolve_graphql_subscription(&context, &counter_subscription(), tx)
        .await
        .unwrap();

    let mut documents = Vec::new();
    while let Some(document) = rx.recv().await {
        documents.push(String::from_utf8(document.to_vec()).unwrap());
    }
    assert_eq!(
        documents,
        [
            r#"{"data":{"counter":0}}"#,
            r#"{"data":{"counter":1}}"#,
            r#"{"data":{"counter":2}}"#,
        ]
    );
    assert_eq!(manager.inputs.lock()[0], Bytes::from_static(br#"{"step":1}"#));
    assert!(manager.unregistered.load(Ordering::SeqCst));
}

#[tokio::test]
async fn cancelled_subscriptions_unregister() {
    let mut manager = FakeTriggerManager::new(vec![r#"{"counter":0}"#]);
    manager.keep_open = true;
    let manager = Arc::new(manager);
    let resolver = Resolver::default().with_trigger_manager(manager.clone());
    let context = Context::builder().variables(json!({"step": 1})).build();
    let (tx, mut rx) = mpsc::channel(8);
    let subscription = counter_subscription();

    let (result, ()) = tokio::join!(
        resolver.resolve_graphql_subscription(&context, &subscription, tx),
        async {
            assert_eq!(
                rx.recv().await,
                Some(Bytes::from_static(br#"{"data":{"counter":0}}"#))
            );
            context.cancel();
        }
    );
    result.unwrap();
    assert!(manager.unregistered.load(Ordering::SeqCst));
}

#[tokio::test]
async fn dropped_receivers_end_subscriptions() {
    let mut manager = FakeTriggerManager::new(vec![]);
    manager.keep_open = true;
    let manager = Arc::new(manager);
    let resolver = Resolver::default().with_trigger_manager(manager.clone());
    let context = Context::builder().variables(json!({"step": 1})).build();
    let (tx, rx) = mpsc::channel(8);
    drop(rx);

    resolver
        .resolve_graphql_subscription(&context, &counter_subscription(), tx)
        .await
        .unwrap();
    assert!(manager.unregistered.load(Ordering::SeqCst));
}

#[tokio::test]
async fn unknown_trigger_managers_are_rejected() {
    let (tx, _rx) = mpsc::channel(1);
    let err = Resolver::default()
        .resolve_graphql_subscription(&Context::default(), &counter_subscription(), tx)
        .await
        .unwrap_err();
    assert_eq!(err, ResolveError::UnknownTriggerManager("fake".to_string()));
}

#[tokio::test]
async fn trigger_input_errors_are_returned() {
    let manager = Arc::new(FakeTriggerManager::new(vec![]));
    let resolver = Resolver::default().with_trigger_manager(manager);
    let (tx, _rx) = mpsc::channel(1);

    let err = resolver
        .resolve_graphql_subscription(&Context::default(), &counter_subscription(), tx)
        .await
        .unwrap_err();
    assert_eq!(
        err,
        ResolveError::Trigger(FetchError::TemplateVariableMissing {
            name: "variables.step".to_string()
        })
    );
}
