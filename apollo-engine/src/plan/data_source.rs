//! The contract between the planner and data source specific sub-planners.
use std::collections::HashMap;
use std::sync::Arc;

use apollo_compiler::ast;
use apollo_compiler::ast::OperationType;
use apollo_compiler::Name;
use apollo_compiler::Node;
use derivative::Derivative;
use serde_json_bytes::ByteString;
use serde_json_bytes::Value;

use crate::error::PlanningError;
use crate::resolve::DataSource;
use crate::resolve::Variable;

/// Where the value of an argument comes from.
#[derive(Clone, Debug, PartialEq)]
pub enum ArgumentValue {
    /// A value written in the operation. May contain nested variables.
    Literal(Node<ast::Value>),
    /// An operation variable, by name.
    Variable(Name),
    /// A path into the object the field is resolved on.
    Object(Vec<String>),
    /// A path into the operation variables.
    Context(Vec<String>),
}

/// An argument of a field, as seen by sub-planners.
#[derive(Clone, Debug, PartialEq)]
pub struct ArgumentBinding {
    pub name: String,
    /// The type declared by the schema for the argument.
    pub ty: ast::Type,
    pub value: ArgumentValue,
}

/// A field event.
#[derive(Clone, Copy, Debug)]
pub struct FieldContext<'a> {
    /// The type the field is selected on.
    pub parent_type: &'a ast::NamedType,
    pub field: &'a ast::Field,
    pub definition: &'a ast::FieldDefinition,
    /// The alias, or the name.
    pub response_key: &'a str,
    /// Where the resolver reads the field from, relative to its parent.
    pub path: &'a [String],
    /// The field starts a fetch of this sub-planner.
    pub is_root: bool,
    pub arguments: &'a [ArgumentBinding],
}

/// What sub-planners are told about the operation.
#[derive(Clone, Debug)]
pub struct PlannerConfiguration {
    pub operation_type: OperationType,
    pub variable_definitions: Vec<Node<ast::VariableDefinition>>,
}

/// The fetch produced by a sub-planner.
#[derive(Clone, Derivative)]
#[derivative(Debug)]
pub struct FetchConfiguration {
    /// The fetch input, with `$$<index>$$` placeholders referencing `variables`.
    pub input: String,
    pub variables: Vec<Variable>,
    #[derivative(Debug = "ignore")]
    pub data_source: Arc<dyn DataSource>,
    pub disallow_single_flight: bool,
}

/// The trigger produced by a sub-planner for a subscription root field.
#[derive(Clone, Debug)]
pub struct SubscriptionConfiguration {
    pub manager_id: String,
    /// The trigger input, with `$$<index>$$` placeholders referencing `variables`.
    pub input: String,
    pub variables: Vec<Variable>,
}

/// Plans the fetches of one data source.
///
/// A sub-planner is created for a root field and observes the events of every field inside it
/// that the same data source serves. Sibling root fields served by the same data source are
/// fed to the same sub-planner.
pub trait DataSourcePlanner {
    fn initialize(&mut self, configuration: PlannerConfiguration);

    fn enter_field(&mut self, field: &FieldContext<'_>);

    fn leave_field(&mut self, field: &FieldContext<'_>);

    fn enter_selection_set(&mut self) {}

    fn leave_selection_set(&mut self) {}

    fn enter_inline_fragment(&mut self, _type_condition: &ast::NamedType) {}

    fn leave_inline_fragment(&mut self) {}

    /// Asks for `field_name` to be loaded in the selection set currently open, for the fetch of
    /// another data source. Returns the path under which the value is found.
    fn add_required_field(&mut self, field_name: &str) -> Vec<String> {
        vec![field_name.to_string()]
    }

    fn plan(&mut self) -> Result<FetchConfiguration, PlanningError>;

    /// `None` when the data source cannot serve subscriptions.
    fn plan_subscription(&mut self) -> Result<Option<SubscriptionConfiguration>, PlanningError> {
        Ok(None)
    }
}

/// Creates sub-planners for one data source kind.
pub trait DataSourcePlannerFactory: Send + Sync {
    /// The kind selected in data source configurations.
    fn kind(&self) -> &str;

    /// A sub-planner for a data source with the given custom configuration.
    fn planner(
        &self,
        custom: &serde_json::Value,
    ) -> Result<Box<dyn DataSourcePlanner>, PlanningError>;
}

/// The sub-planner factories, by kind.
#[derive(Clone, Default)]
pub struct DataSourceRegistry {
    factories: HashMap<String, Arc<dyn DataSourcePlannerFactory>>,
}

impl DataSourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `factory`, replacing any factory of the same kind.
    pub fn register(mut self, factory: impl DataSourcePlannerFactory + 'static) -> Self {
        self.factories
            .insert(factory.kind().to_string(), Arc::new(factory));
        self
    }

    pub fn get(&self, kind: &str) -> Option<&dyn DataSourcePlannerFactory> {
        self.factories.get(kind).map(|factory| factory.as_ref())
    }
}

/// The lifecycle of a sub-planner.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SubPlannerState {
    Uninitialized,
    Initialized,
    Accumulating,
    Finalized,
}

/// Guards the lifecycle of a sub-planner. Misuse is a planner defect and panics.
pub(crate) struct SubPlanner {
    kind: String,
    inner: Box<dyn DataSourcePlanner>,
    state: SubPlannerState,
}

impl SubPlanner {
    pub(crate) fn new(kind: &str, inner: Box<dyn DataSourcePlanner>) -> Self {
        Self {
            kind: kind.to_string(),
            inner,
            state: SubPlannerState::Uninitialized,
        }
    }

    pub(crate) fn state(&self) -> SubPlannerState {
        self.state
    }

    pub(crate) fn initialize(&mut self, configuration: PlannerConfiguration) {
        assert_eq!(
            self.state,
            SubPlannerState::Uninitialized,
            "sub-planner '{}' initialized twice",
            self.kind
        );
        self.inner.initialize(configuration);
        self.state = SubPlannerState::Initialized;
    }

    fn accumulate(&mut self) -> &mut dyn DataSourcePlanner {
        match self.state {
            SubPlannerState::Initialized | SubPlannerState::Accumulating => {
                self.state = SubPlannerState::Accumulating;
                self.inner.as_mut()
            }
            state => panic!("sub-planner '{}' received an event in state {state:?}", self.kind),
        }
    }

    fn finalize(&mut self) {
        assert_eq!(
            self.state,
            SubPlannerState::Accumulating,
            "sub-planner '{}' cannot be finalized in state {:?}",
            self.kind,
            self.state
        );
        self.state = SubPlannerState::Finalized;
    }

    pub(crate) fn enter_field(&mut self, field: &FieldContext<'_>) {
        self.accumulate().enter_field(field)
    }

    pub(crate) fn leave_field(&mut self, field: &FieldContext<'_>) {
        self.accumulate().leave_field(field)
    }

    pub(crate) fn enter_selection_set(&mut self) {
        self.accumulate().enter_selection_set()
    }

    pub(crate) fn leave_selection_set(&mut self) {
        self.accumulate().leave_selection_set()
    }

    pub(crate) fn enter_inline_fragment(&mut self, type_condition: &ast::NamedType) {
        self.accumulate().enter_inline_fragment(type_condition)
    }

    pub(crate) fn leave_inline_fragment(&mut self) {
        self.accumulate().leave_inline_fragment()
    }

    pub(crate) fn add_required_field(&mut self, field_name: &str) -> Vec<String> {
        self.accumulate().add_required_field(field_name)
    }

    pub(crate) fn plan(&mut self) -> Result<FetchConfiguration, PlanningError> {
        self.finalize();
        self.inner.plan()
    }

    pub(crate) fn plan_subscription(&mut self) -> Result<SubscriptionConfiguration, PlanningError> {
        self.finalize();
        self.inner
            .plan_subscription()?
            .ok_or_else(|| PlanningError::SubscriptionUnsupported(self.kind.clone()))
    }
}

/// The JSON of a literal, `None` when it contains variables.
pub fn literal_to_json(value: &ast::Value) -> Option<Value> {
    Some(match value {
        ast::Value::Null => Value::Null,
        ast::Value::Enum(name) => Value::from(name.as_str()),
        ast::Value::Variable(_) => return None,
        ast::Value::String(string) => Value::from(string.as_str()),
        ast::Value::Float(float) => Value::from(float.try_to_f64().ok()?),
        ast::Value::Int(int) => match int.try_to_i32() {
            Ok(int) => Value::from(int),
            Err(_) => Value::from(int.try_to_f64().ok()?),
        },
        ast::Value::Boolean(boolean) => Value::Bool(*boolean),
        ast::Value::List(items) => Value::Array(
            items
                .iter()
                .map(|item| literal_to_json(item))
                .collect::<Option<_>>()?,
        ),
        ast::Value::Object(fields) => Value::Object(
            fields
                .iter()
                .map(|(name, value)| Some((ByteString::from(name.as_str()), literal_to_json(value)?)))
                .collect::<Option<_>>()?,
        ),
    })
}

/// The variables referenced by a value, in order of appearance.
pub fn variables_in(value: &ast::Value, variables: &mut Vec<Name>) {
    match value {
        ast::Value::Variable(name) => {
            if !variables.contains(name) {
                variables.push(name.clone());
            }
        }
        ast::Value::List(items) => items.iter().for_each(|item| variables_in(item, variables)),
        ast::Value::Object(fields) => fields
            .iter()
            .for_each(|(_, value)| variables_in(value, variables)),
        _ => {}
    }
}
