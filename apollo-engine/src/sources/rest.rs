//! Sub-planner for REST upstreams.
//!
//! The request is described by templates: `{{ .arguments.<name> }}`, `{{ .object.<path> }}` and
//! `{{ .request.headers.<name> }}` expressions are replaced by variables in the url, the header
//! values, the query parameter values and the body.
use std::collections::BTreeMap;
use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Captures;
use regex::Regex;
use schemars::JsonSchema;
use serde::Deserialize;
use serde::Serialize;

use super::graphql::json_string;
use super::polling;
use crate::error::PlanningError;
use crate::json_ext::ValueExt;
use crate::plan::literal_to_json;
use crate::plan::ArgumentBinding;
use crate::plan::ArgumentValue;
use crate::plan::DataSourcePlanner;
use crate::plan::DataSourcePlannerFactory;
use crate::plan::FetchConfiguration;
use crate::plan::FieldContext;
use crate::plan::PlannerConfiguration;
use crate::plan::SubscriptionConfiguration;
use crate::resolve::DataSource;
use crate::resolve::Variable;

/// The kind of REST data sources.
pub const KIND: &str = "rest";

static EXPRESSION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\{\{\s*\.(arguments|object|request\.headers)\.([A-Za-z0-9_\-]+(?:\.[A-Za-z0-9_\-]+)*)\s*\}\}")
        .expect("expression regex is valid")
});

/// Custom configuration of a REST data source.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct RestConfiguration {
    /// The endpoint, may contain template expressions.
    pub url: String,

    #[serde(default = "default_method")]
    pub method: String,

    /// The request body. Embedded as JSON when it parses as JSON.
    #[serde(default)]
    pub body: Option<String>,

    #[serde(default)]
    pub headers: BTreeMap<String, Vec<String>>,

    #[serde(default)]
    pub query_params: Vec<QueryParameter>,

    /// Serves subscription root fields by polling the endpoint.
    #[serde(default)]
    pub subscription: Option<PollingConfiguration>,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct QueryParameter {
    pub name: String,
    pub value: String,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct PollingConfiguration {
    pub polling_interval_millis: u64,

    /// Only publish responses differing from the previous one.
    #[serde(default)]
    pub skip_publish_same_response: bool,
}

fn default_method() -> String {
    "GET".to_string()
}

/// Creates [`RestPlanner`]s loading through one data source.
pub struct RestPlannerFactory {
    data_source: Arc<dyn DataSource>,
}

impl RestPlannerFactory {
    pub fn new(data_source: Arc<dyn DataSource>) -> Self {
        Self { data_source }
    }
}

impl DataSourcePlannerFactory for RestPlannerFactory {
    fn kind(&self) -> &str {
        KIND
    }

    fn planner(
        &self,
        custom: &serde_json::Value,
    ) -> Result<Box<dyn DataSourcePlanner>, PlanningError> {
        let configuration: RestConfiguration =
            serde_json::from_value(custom.clone()).map_err(|err| {
                PlanningError::InvalidDataSourceConfiguration {
                    kind: KIND.to_string(),
                    reason: err.to_string(),
                }
            })?;
        Ok(Box::new(RestPlanner {
            configuration,
            data_source: self.data_source.clone(),
            arguments: Vec::new(),
        }))
    }
}

/// Plans one request per root field. Nested fields are read from the response.
pub struct RestPlanner {
    configuration: RestConfiguration,
    data_source: Arc<dyn DataSource>,
    arguments: Vec<ArgumentBinding>,
}

/// Replaces template expressions with placeholders and collects their variables.
struct Renderer<'a> {
    arguments: &'a [ArgumentBinding],
    variables: Vec<Variable>,
}

impl Renderer<'_> {
    /// The rendered template, and whether every argument it references is present.
    ///
    /// Absent arguments read the operation variable of the same name.
    fn render(&mut self, template: &str) -> (String, bool) {
        let mut complete = true;
        let rendered = EXPRESSION
            .replace_all(template, |captures: &Captures| {
                let path: Vec<String> = captures[2].split('.').map(str::to_string).collect();
                let variable = match &captures[1] {
                    "arguments" => self.argument(&path).unwrap_or_else(|| {
                        complete = false;
                        Variable::context(path)
                    }),
                    "object" => Variable::object(path),
                    _ => Variable::header(&captures[2]),
                };
                self.placeholder(variable.escaped())
            })
            .into_owned();
        (rendered, complete)
    }

    fn argument(&self, path: &[String]) -> Option<Variable> {
        let (name, rest) = path.split_first()?;
        let argument = self
            .arguments
            .iter()
            .find(|argument| &argument.name == name)?;
        let joined = |prefix: &[String]| prefix.iter().chain(rest).cloned().collect::<Vec<_>>();
        Some(match &argument.value {
            ArgumentValue::Literal(value) => {
                let value = literal_to_json(value)?;
                Variable::constant(value.get_path(rest)?.clone())
            }
            ArgumentValue::Variable(variable) => {
                Variable::context(joined(&[variable.to_string()]))
            }
            ArgumentValue::Object(source) => Variable::object(joined(source)),
            ArgumentValue::Context(source) => Variable::context(joined(source)),
        })
    }

    fn placeholder(&mut self, variable: Variable) -> String {
        let index = match self.variables.iter().position(|known| *known == variable) {
            Some(index) => index,
            None => {
                self.variables.push(variable);
                self.variables.len() - 1
            }
        };
        format!("$${index}$$")
    }
}

impl RestPlanner {
    fn input(&self) -> (String, Vec<Variable>) {
        let configuration = &self.configuration;
        let mut renderer = Renderer {
            arguments: &self.arguments,
            variables: Vec::new(),
        };

        let (url, _) = renderer.render(&configuration.url);
        let mut input = format!(
            r#"{{"method":{},"url":{}"#,
            json_string(&configuration.method),
            json_string(&url),
        );

        if !configuration.headers.is_empty() {
            let headers: Vec<String> = configuration
                .headers
                .iter()
                .map(|(name, values)| {
                    let values: Vec<String> = values
                        .iter()
                        .map(|value| json_string(&renderer.render(value).0))
                        .collect();
                    format!("{}:[{}]", json_string(name), values.join(","))
                })
                .collect();
            input.push_str(&format!(r#","headers":{{{}}}"#, headers.join(",")));
        }

        let query_params: Vec<String> = configuration
            .query_params
            .iter()
            .filter_map(|parameter| {
                let known = renderer.variables.len();
                let (value, complete) = renderer.render(&parameter.value);
                if !complete {
                    renderer.variables.truncate(known);
                }
                complete.then(|| {
                    format!(
                        r#"{{"name":{},"value":{}}}"#,
                        json_string(&parameter.name),
                        json_string(&value)
                    )
                })
            })
            .collect();
        if !query_params.is_empty() {
            input.push_str(&format!(r#","query_params":[{}]"#, query_params.join(",")));
        }

        if let Some(body) = &configuration.body {
            let (body, _) = renderer.render(body);
            let body = if serde_json::from_str::<serde_json::Value>(&body).is_ok() {
                body
            } else {
                json_string(&body)
            };
            input.push_str(&format!(r#","body":{body}"#));
        }
        input.push('}');
        (input, renderer.variables)
    }
}

impl DataSourcePlanner for RestPlanner {
    fn initialize(&mut self, _configuration: PlannerConfiguration) {}

    fn enter_field(&mut self, field: &FieldContext<'_>) {
        if field.is_root {
            self.arguments = field.arguments.to_vec();
        }
    }

    fn leave_field(&mut self, _field: &FieldContext<'_>) {}

    fn plan(&mut self) -> Result<FetchConfiguration, PlanningError> {
        let (input, variables) = self.input();
        let disallow_single_flight = matches!(
            self.configuration.method.to_ascii_uppercase().as_str(),
            "POST" | "PUT" | "PATCH" | "DELETE"
        );
        Ok(FetchConfiguration {
            input,
            variables,
            data_source: self.data_source.clone(),
            disallow_single_flight,
        })
    }

    fn plan_subscription(&mut self) -> Result<Option<SubscriptionConfiguration>, PlanningError> {
        let polling = self.configuration.subscription.clone().ok_or_else(|| {
            PlanningError::InvalidDataSourceConfiguration {
                kind: KIND.to_string(),
                reason: "subscription fields need a `subscription` polling configuration"
                    .to_string(),
            }
        })?;
        let (input, variables) = self.input();
        Ok(Some(SubscriptionConfiguration {
            manager_id: polling::MANAGER_ID.to_string(),
            input: format!(
                r#"{{"interval":{},"request_input":{input},"skip_publish_same_response":{}}}"#,
                polling.polling_interval_millis, polling.skip_publish_same_response
            ),
            variables,
        }))
    }
}
