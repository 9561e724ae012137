//! Sub-planner for GraphQL upstreams.
//!
//! The fields a GraphQL data source serves are printed back into one upstream operation. The
//! fetch input is a JSON document carrying the url, the HTTP method and the request body; the
//! [`DataSource`] is responsible for sending it.
use std::sync::Arc;

use apollo_compiler::ast;
use apollo_compiler::ast::OperationType;
use apollo_compiler::Name;
use apollo_compiler::Node;
use schemars::JsonSchema;
use serde::Deserialize;
use serde::Serialize;

use crate::error::PlanningError;
use crate::plan::variables_in;
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

/// The kind of GraphQL data sources.
pub const KIND: &str = "graphql";

/// The trigger manager serving GraphQL subscriptions.
pub const SUBSCRIPTION_MANAGER_ID: &str = "graphql_subscription";

/// Prefix of the aliases of fields selected for nested fetches.
pub const DEPENDENCY_ALIAS_PREFIX: &str = "__dep__";

/// Custom configuration of a GraphQL data source.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct GraphQLConfiguration {
    /// The upstream endpoint.
    pub url: String,

    #[serde(default = "default_method")]
    pub method: String,
}

fn default_method() -> String {
    "POST".to_string()
}

/// Creates [`GraphQLPlanner`]s loading through one data source.
pub struct GraphQLPlannerFactory {
    data_source: Arc<dyn DataSource>,
}

impl GraphQLPlannerFactory {
    pub fn new(data_source: Arc<dyn DataSource>) -> Self {
        Self { data_source }
    }
}

impl DataSourcePlannerFactory for GraphQLPlannerFactory {
    fn kind(&self) -> &str {
        KIND
    }

    fn planner(
        &self,
        custom: &serde_json::Value,
    ) -> Result<Box<dyn DataSourcePlanner>, PlanningError> {
        let configuration: GraphQLConfiguration = serde_json::from_value(custom.clone())
            .map_err(|err| PlanningError::InvalidDataSourceConfiguration {
                kind: KIND.to_string(),
                reason: err.to_string(),
            })?;
        Ok(Box::new(GraphQLPlanner::new(
            configuration,
            self.data_source.clone(),
        )))
    }
}

#[derive(Debug, PartialEq)]
struct Selection {
    /// Everything before the selection set: alias, name and arguments, or the type condition.
    head: String,
    children: Option<Vec<Selection>>,
}

impl Selection {
    fn print(&self, out: &mut String) {
        out.push_str(&self.head);
        if let Some(children) = &self.children {
            out.push(' ');
            print_selection_set(children, out);
        }
    }
}

fn print_selection_set(selections: &[Selection], out: &mut String) {
    out.push('{');
    if selections.is_empty() {
        out.push_str("__typename");
    }
    for (index, selection) in selections.iter().enumerate() {
        if index > 0 {
            out.push(' ');
        }
        selection.print(out);
    }
    out.push('}');
}

struct Frame {
    head: String,
    selections: Vec<Selection>,
    has_selection_set: bool,
}

impl Frame {
    fn new(head: String, has_selection_set: bool) -> Self {
        Self {
            head,
            selections: Vec::new(),
            has_selection_set,
        }
    }

    fn into_selection(self) -> Selection {
        Selection {
            head: self.head,
            children: self.has_selection_set.then_some(self.selections),
        }
    }
}

/// A variable of the upstream operation.
#[derive(Debug)]
struct Declaration {
    name: String,
    ty: String,
    variable: Variable,
}

/// Prints the fields of one GraphQL data source into an upstream operation.
pub struct GraphQLPlanner {
    configuration: GraphQLConfiguration,
    data_source: Arc<dyn DataSource>,
    operation_type: OperationType,
    variable_definitions: Vec<Node<ast::VariableDefinition>>,
    stack: Vec<Frame>,
    declarations: Vec<Declaration>,
}

impl GraphQLPlanner {
    pub fn new(configuration: GraphQLConfiguration, data_source: Arc<dyn DataSource>) -> Self {
        Self {
            configuration,
            data_source,
            operation_type: OperationType::Query,
            variable_definitions: Vec::new(),
            stack: vec![Frame::new(String::new(), true)],
            declarations: Vec::new(),
        }
    }

    fn head(&mut self, field: &FieldContext<'_>) -> String {
        let mut head = match field.path {
            [mapped] if mapped != field.response_key => mapped.clone(),
            _ => match &field.field.alias {
                Some(alias) => format!("{alias}: {}", field.field.name),
                None => field.field.name.to_string(),
            },
        };
        if !field.arguments.is_empty() {
            let arguments: Vec<String> = field
                .arguments
                .iter()
                .map(|argument| format!("{}: {}", argument.name, self.argument_value(argument)))
                .collect();
            head.push('(');
            head.push_str(&arguments.join(", "));
            head.push(')');
        }
        head
    }

    fn argument_value(&mut self, argument: &ArgumentBinding) -> String {
        match &argument.value {
            ArgumentValue::Literal(value) => {
                let mut variables = Vec::new();
                variables_in(value, &mut variables);
                for variable in variables {
                    self.declare_operation_variable(&variable, None);
                }
                ast::Value::serialize(value).no_indent().to_string()
            }
            ArgumentValue::Variable(variable) => {
                self.declare_operation_variable(variable, Some(&argument.ty));
                format!("${variable}")
            }
            ArgumentValue::Object(path) => {
                let name = self.declare(Variable::object(path.clone()), &argument.ty);
                format!("${name}")
            }
            ArgumentValue::Context(path) => {
                let name = self.declare(Variable::context(path.clone()), &argument.ty);
                format!("${name}")
            }
        }
    }

    /// Forwards an operation variable under its own name and type.
    fn declare_operation_variable(&mut self, name: &Name, ty: Option<&ast::Type>) {
        if self
            .declarations
            .iter()
            .any(|declaration| declaration.name == name.as_str())
        {
            return;
        }
        let ty = self
            .variable_definitions
            .iter()
            .find(|definition| definition.name == *name)
            .map(|definition| definition.ty.to_string())
            .or_else(|| ty.map(ToString::to_string))
            .unwrap_or_else(|| "String".to_string());
        self.declarations.push(Declaration {
            name: name.to_string(),
            ty,
            variable: Variable::context([name.as_str()]),
        });
    }

    /// Declares a generated variable for `variable`, reusing an identical one.
    fn declare(&mut self, variable: Variable, ty: &ast::Type) -> String {
        if let Some(declaration) = self
            .declarations
            .iter()
            .find(|declaration| declaration.variable == variable)
        {
            return declaration.name.clone();
        }
        let name = (0..)
            .map(generated_name)
            .find(|name| {
                !self
                    .declarations
                    .iter()
                    .any(|declaration| &declaration.name == name)
                    && !self
                        .variable_definitions
                        .iter()
                        .any(|definition| definition.name.as_str() == name)
            })
            .unwrap_or_default();
        self.declarations.push(Declaration {
            name: name.clone(),
            ty: ty.to_string(),
            variable,
        });
        name
    }

    fn query(&self) -> String {
        let keyword = match self.operation_type {
            OperationType::Query => "query",
            OperationType::Mutation => "mutation",
            OperationType::Subscription => "subscription",
        };
        let mut query = String::from(keyword);
        if !self.declarations.is_empty() {
            let definitions: Vec<String> = self
                .declarations
                .iter()
                .map(|declaration| format!("${}: {}", declaration.name, declaration.ty))
                .collect();
            query.push('(');
            query.push_str(&definitions.join(", "));
            query.push(')');
        } else {
            query.push(' ');
        }
        if let Some(root) = self.stack.first() {
            print_selection_set(&root.selections, &mut query);
        }
        query
    }

    fn input(&self) -> String {
        let mut input = format!(
            r#"{{"url":{},"method":{},"body":{{"query":{},"variables":{{"#,
            json_string(&self.configuration.url),
            json_string(&self.configuration.method),
            json_string(&self.query()),
        );
        for (index, declaration) in self.declarations.iter().enumerate() {
            if index > 0 {
                input.push(',');
            }
            input.push_str(&format!("{}:$${index}$$", json_string(&declaration.name)));
        }
        input.push_str("}}}");
        input
    }

    fn variables(&self) -> Vec<Variable> {
        self.declarations
            .iter()
            .map(|declaration| declaration.variable.clone())
            .collect()
    }
}

impl DataSourcePlanner for GraphQLPlanner {
    fn initialize(&mut self, configuration: PlannerConfiguration) {
        self.operation_type = configuration.operation_type;
        self.variable_definitions = configuration.variable_definitions;
    }

    fn enter_field(&mut self, field: &FieldContext<'_>) {
        let head = self.head(field);
        self.stack.push(Frame::new(head, false));
    }

    fn leave_field(&mut self, _field: &FieldContext<'_>) {
        self.close_frame();
    }

    fn enter_selection_set(&mut self) {
        if let Some(frame) = self.stack.last_mut() {
            frame.has_selection_set = true;
        }
    }

    fn enter_inline_fragment(&mut self, type_condition: &ast::NamedType) {
        self.stack
            .push(Frame::new(format!("... on {type_condition}"), true));
    }

    fn leave_inline_fragment(&mut self) {
        self.close_frame();
    }

    fn add_required_field(&mut self, field_name: &str) -> Vec<String> {
        let alias = format!("{DEPENDENCY_ALIAS_PREFIX}{field_name}");
        let head = format!("{alias}: {field_name}");
        if let Some(frame) = self.stack.last_mut() {
            if !frame.selections.iter().any(|selection| selection.head == head) {
                frame.selections.push(Selection {
                    head,
                    children: None,
                });
            }
        }
        vec![alias]
    }

    fn plan(&mut self) -> Result<FetchConfiguration, PlanningError> {
        Ok(FetchConfiguration {
            input: self.input(),
            variables: self.variables(),
            data_source: self.data_source.clone(),
            disallow_single_flight: self.operation_type == OperationType::Mutation,
        })
    }

    fn plan_subscription(&mut self) -> Result<Option<SubscriptionConfiguration>, PlanningError> {
        Ok(Some(SubscriptionConfiguration {
            manager_id: SUBSCRIPTION_MANAGER_ID.to_string(),
            input: self.input(),
            variables: self.variables(),
        }))
    }
}

impl GraphQLPlanner {
    fn close_frame(&mut self) {
        if self.stack.len() < 2 {
            return;
        }
        if let Some(frame) = self.stack.pop() {
            if let Some(parent) = self.stack.last_mut() {
                parent.selections.push(frame.into_selection());
            }
        }
    }
}

/// `a`, `b`, ..., `z`, `aa`, `ab`, ...
fn generated_name(mut index: usize) -> String {
    let mut name = Vec::new();
    loop {
        name.push(b'a' + (index % 26) as u8);
        if index < 26 {
            break;
        }
        index = index / 26 - 1;
    }
    name.reverse();
    String::from_utf8_lossy(&name).into_owned()
}

pub(crate) fn json_string(value: &str) -> String {
    serde_json::Value::from(value).to_string()
}
