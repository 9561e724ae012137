use apollo_compiler::ast;
use apollo_compiler::ast::OperationType;
use apollo_compiler::schema::ExtendedType;
use apollo_compiler::Node as AstNode;
use apollo_compiler::Schema;

use super::data_source::ArgumentBinding;
use super::data_source::ArgumentValue;
use super::data_source::FieldContext;
use super::data_source::PlannerConfiguration;
use super::data_source::SubPlanner;
use super::walker::Visitor;
use super::DataSourceRegistry;
use super::Plan;
use super::SubscriptionResponsePlan;
use super::SynchronousResponsePlan;
use crate::configuration::ArgumentSource;
use crate::error::PlanningError;
use crate::resolve::Array;
use crate::resolve::Fetch;
use crate::resolve::Field;
use crate::resolve::GraphQLResponse;
use crate::resolve::GraphQLSubscription;
use crate::resolve::GraphQLSubscriptionTrigger;
use crate::resolve::InputTemplate;
use crate::resolve::Node;
use crate::resolve::Object;
use crate::resolve::Scalar;
use crate::resolve::SingleFetch;
use crate::resolve::SkipCondition;
use crate::resolve::VariableSource;
use crate::Configuration;

/// An object being planned.
struct ObjectFrame {
    type_name: ast::NamedType,
    fields: Vec<Field>,
    /// Sub-planners whose root fields are on this object, in creation order.
    planners: Vec<usize>,
}

#[derive(Clone, Copy)]
enum Leaf {
    String,
    Integer,
    Float,
    Boolean,
}

/// A field being planned.
struct FieldFrame {
    response_key: String,
    path: Vec<String>,
    ty: ast::Type,
    leaf: Option<Leaf>,
    /// The sub-planner observing the field.
    owner: Option<usize>,
    /// The sub-planner whose fetch starts at this field.
    root_of: Option<usize>,
    on_type_name: Option<String>,
    skip: Option<SkipCondition>,
    arguments: Vec<ArgumentBinding>,
    object: Option<Object>,
}

enum Output {
    Fetch(usize),
    Trigger,
}

struct PlannerEntry {
    sub_planner: SubPlanner,
    data_source: usize,
    output: Output,
    /// The sub-planner owning the object the root fields are on.
    parent: Option<usize>,
    /// The type the root fields are selected on.
    on_type: ast::NamedType,
}

#[derive(Clone, Copy, PartialEq)]
enum SetKind {
    Object,
    Fragment,
}

pub(crate) struct PlanningVisitor<'a> {
    schema: &'a Schema,
    configuration: &'a Configuration,
    registry: &'a DataSourceRegistry,
    operation_type: OperationType,
    variable_definitions: Vec<AstNode<ast::VariableDefinition>>,
    objects: Vec<ObjectFrame>,
    fields: Vec<FieldFrame>,
    planners: Vec<PlannerEntry>,
    sets: Vec<SetKind>,
    next_set: SetKind,
    fragment_skips: Vec<Option<SkipCondition>>,
    next_buffer_id: usize,
    root: Option<Object>,
    trigger: Option<GraphQLSubscriptionTrigger>,
}

impl<'a> PlanningVisitor<'a> {
    pub(crate) fn new(
        schema: &'a Schema,
        configuration: &'a Configuration,
        registry: &'a DataSourceRegistry,
    ) -> Self {
        Self {
            schema,
            configuration,
            registry,
            operation_type: OperationType::Query,
            variable_definitions: Vec::new(),
            objects: Vec::new(),
            fields: Vec::new(),
            planners: Vec::new(),
            sets: Vec::new(),
            next_set: SetKind::Object,
            fragment_skips: Vec::new(),
            next_buffer_id: 0,
            root: None,
            trigger: None,
        }
    }

    pub(crate) fn into_plan(self) -> Result<Plan, PlanningError> {
        let root = self.root.unwrap_or_default();
        let response = GraphQLResponse { data: root.into() };
        Ok(match self.trigger {
            Some(trigger) => Plan::Subscription(SubscriptionResponsePlan {
                response: GraphQLSubscription { trigger, response },
            }),
            None => Plan::Synchronous(SynchronousResponsePlan { response }),
        })
    }

    /// The sub-planner observing the innermost field.
    fn enclosing_owner(&self) -> Option<usize> {
        self.fields.last().and_then(|field| field.owner)
    }

    fn leaf(&self, type_name: &ast::NamedType) -> Result<Option<Leaf>, PlanningError> {
        match self.schema.types.get(type_name) {
            Some(ExtendedType::Scalar(_)) | Some(ExtendedType::Enum(_)) => {
                Ok(Some(match type_name.as_str() {
                    "Int" => Leaf::Integer,
                    "Float" => Leaf::Float,
                    "Boolean" => Leaf::Boolean,
                    _ => Leaf::String,
                }))
            }
            Some(_) => Ok(None),
            None => Err(PlanningError::UnknownType(type_name.to_string())),
        }
    }

    fn path(&self, parent_type: &str, field: &ast::Field, response_key: &str) -> Vec<String> {
        match self.configuration.field(parent_type, &field.name) {
            Some(configuration) if configuration.disable_default_mapping => Vec::new(),
            Some(configuration) if configuration.path.is_some() => {
                configuration.path.clone().unwrap_or_default()
            }
            _ => vec![response_key.to_string()],
        }
    }

    /// The arguments forwarded upstream.
    ///
    /// Operation arguments are forwarded as written unless configured otherwise; configured
    /// field arguments missing from the operation are left out.
    fn arguments(
        &self,
        parent_type: &str,
        definition: &ast::FieldDefinition,
        field: &ast::Field,
    ) -> Vec<ArgumentBinding> {
        let configured = self
            .configuration
            .field(parent_type, &field.name)
            .map(|configuration| configuration.arguments.as_slice())
            .unwrap_or_default();
        let ty = |name: &str| {
            definition
                .arguments
                .iter()
                .find(|argument| argument.name.as_str() == name)
                .map(|argument| ast::Type::clone(&argument.ty))
                .unwrap_or_else(|| ast::Type::Named(apollo_compiler::name!("String")))
        };
        let from_operation = |name: &str| {
            field
                .arguments
                .iter()
                .find(|argument| argument.name.as_str() == name)
                .map(|argument| match &*argument.value {
                    ast::Value::Variable(variable) => ArgumentValue::Variable(variable.clone()),
                    _ => ArgumentValue::Literal(argument.value.clone()),
                })
        };
        let bind = |name: &str| {
            let value = match configured.iter().find(|argument| argument.name == name) {
                None => from_operation(name)?,
                Some(argument) => match argument.source {
                    ArgumentSource::FieldArgument => from_operation(name)?,
                    ArgumentSource::ObjectField => {
                        ArgumentValue::Object(argument.source_path.clone())
                    }
                    ArgumentSource::ContextVariable => {
                        ArgumentValue::Context(argument.source_path.clone())
                    }
                },
            };
            Some(ArgumentBinding {
                name: name.to_string(),
                ty: ty(name),
                value,
            })
        };

        let mut bindings: Vec<ArgumentBinding> = field
            .arguments
            .iter()
            .filter_map(|argument| bind(argument.name.as_str()))
            .collect();
        for argument in configured {
            if !field.arguments.iter().any(|a| a.name.as_str() == argument.name) {
                bindings.extend(bind(&argument.name));
            }
        }
        bindings
    }

    fn create_planner(
        &mut self,
        data_source: usize,
        parent: Option<usize>,
        on_type: &ast::NamedType,
    ) -> Result<usize, PlanningError> {
        let configuration = &self.configuration.data_sources[data_source];
        let factory = self
            .registry
            .get(&configuration.kind)
            .ok_or_else(|| PlanningError::UnknownDataSourceKind(configuration.kind.clone()))?;
        let mut sub_planner =
            SubPlanner::new(&configuration.kind, factory.planner(&configuration.custom)?);
        sub_planner.initialize(PlannerConfiguration {
            operation_type: self.operation_type,
            variable_definitions: self.variable_definitions.clone(),
        });

        let output = if self.operation_type == OperationType::Subscription && self.fields.is_empty()
        {
            Output::Trigger
        } else {
            self.next_buffer_id += 1;
            Output::Fetch(self.next_buffer_id - 1)
        };
        let index = self.planners.len();
        self.planners.push(PlannerEntry {
            sub_planner,
            data_source,
            output,
            parent,
            on_type: on_type.clone(),
        });
        if let Some(frame) = self.objects.last_mut() {
            frame.planners.push(index);
        }
        tracing::debug!(kind = %configuration.kind, index, "created sub-planner");
        Ok(index)
    }

    /// Finalizes a sub-planner: its fetch, or the subscription trigger.
    fn finalize(&mut self, index: usize) -> Result<Option<Fetch>, PlanningError> {
        if let Some(parent) = self.planners[index].parent {
            let on_type = self.planners[index].on_type.clone();
            for required in self.configuration.required_fields(&on_type) {
                self.planners[parent]
                    .sub_planner
                    .add_required_field(required);
            }
        }

        let parent = self.planners[index].parent;
        let buffer_id = match self.planners[index].output {
            Output::Fetch(buffer_id) => buffer_id,
            Output::Trigger => {
                let configuration = self.planners[index].sub_planner.plan_subscription()?;
                self.trigger = Some(GraphQLSubscriptionTrigger {
                    manager_id: configuration.manager_id,
                    input: InputTemplate::parse(&configuration.input, &configuration.variables),
                    variables: configuration.variables,
                });
                return Ok(None);
            }
        };
        let mut configuration = self.planners[index].sub_planner.plan()?;

        if let Some(parent) = parent {
            for variable in configuration
                .variables
                .iter_mut()
                .filter(|variable| variable.source == VariableSource::Object)
            {
                if let Some((first, rest)) = variable.path.split_first() {
                    let mut path = self.planners[parent]
                        .sub_planner
                        .add_required_field(first);
                    path.extend_from_slice(rest);
                    variable.path = path;
                }
            }
        }

        tracing::debug!(buffer_id, input = %configuration.input, "planned fetch");
        let mut fetch = SingleFetch::new(
            buffer_id,
            configuration.data_source,
            &configuration.input,
            configuration.variables,
        );
        if configuration.disallow_single_flight {
            fetch = fetch.disallow_single_flight();
        }
        Ok(Some(fetch.into()))
    }

    fn field_context<'f>(
        frame: &'f FieldFrame,
        parent_type: &'f ast::NamedType,
        definition: &'f ast::FieldDefinition,
        field: &'f ast::Field,
    ) -> FieldContext<'f> {
        FieldContext {
            parent_type,
            field,
            definition,
            response_key: &frame.response_key,
            path: &frame.path,
            is_root: frame.root_of.is_some(),
            arguments: &frame.arguments,
        }
    }
}

fn skip_condition(directives: &ast::DirectiveList) -> Option<SkipCondition> {
    [("skip", true), ("include", false)]
        .into_iter()
        .find_map(|(name, skip_if)| {
            let directive = directives.get(name)?;
            let condition = directive
                .arguments
                .iter()
                .find(|argument| argument.name == "if")?;
            match &*condition.value {
                ast::Value::Variable(variable) => Some(SkipCondition::Variable {
                    path: vec![variable.to_string()],
                    skip_if,
                }),
                _ => None,
            }
        })
}

/// Wraps the node of a named type into the arrays of the list types around it.
///
/// The outermost node reads `path`; nested nodes read the list item itself.
fn wrap(ty: &ast::Type, path: Vec<String>, named: impl FnOnce(Vec<String>, bool) -> Node) -> Node {
    let (item, nullable) = match ty {
        ast::Type::Named(_) => return named(path, true),
        ast::Type::NonNullNamed(_) => return named(path, false),
        ast::Type::List(item) => (item, true),
        ast::Type::NonNullList(item) => (item, false),
    };
    let item = wrap(item, Vec::new(), named);
    let asynchronous = matches!(&item, Node::Object(object) if object.fetch.is_some());
    let mut array = Array::of(item).at(path);
    array.nullable = nullable;
    array.resolve_asynchronous = asynchronous;
    array.into()
}

impl Visitor for PlanningVisitor<'_> {
    fn schema(&self) -> &Schema {
        self.schema
    }

    fn enter_operation(
        &mut self,
        _root_type: &ast::NamedType,
        operation: &ast::OperationDefinition,
    ) -> Result<(), PlanningError> {
        self.operation_type = operation.operation_type;
        self.variable_definitions = operation.variables.clone();
        self.next_set = SetKind::Object;
        Ok(())
    }

    fn enter_selection_set(&mut self, parent_type: &ast::NamedType) -> Result<(), PlanningError> {
        let kind = std::mem::replace(&mut self.next_set, SetKind::Object);
        self.sets.push(kind);
        if kind == SetKind::Object {
            self.objects.push(ObjectFrame {
                type_name: parent_type.clone(),
                fields: Vec::new(),
                planners: Vec::new(),
            });
        }
        if let Some(owner) = self.enclosing_owner() {
            self.planners[owner].sub_planner.enter_selection_set();
        }
        Ok(())
    }

    fn leave_selection_set(&mut self, _parent_type: &ast::NamedType) -> Result<(), PlanningError> {
        if self.sets.pop() == Some(SetKind::Object) {
            let planners = self
                .objects
                .last()
                .map(|frame| frame.planners.clone())
                .unwrap_or_default();
            let serial = self.operation_type == OperationType::Mutation && self.fields.is_empty();
            let mut fetch: Option<Fetch> = None;
            for index in planners {
                if let Some(next) = self.finalize(index)? {
                    fetch = Some(match fetch {
                        None => next,
                        Some(fetch) if serial => fetch.serial(next),
                        Some(fetch) => fetch.parallel(next),
                    });
                }
            }

            if let Some(frame) = self.objects.pop() {
                let object = Object {
                    fields: frame.fields,
                    fetch,
                    ..Default::default()
                };
                match self.fields.last_mut() {
                    Some(field) => field.object = Some(object),
                    None => self.root = Some(object),
                }
            }
        }
        if let Some(owner) = self.enclosing_owner() {
            self.planners[owner].sub_planner.leave_selection_set();
        }
        Ok(())
    }

    fn enter_field(
        &mut self,
        parent_type: &ast::NamedType,
        definition: &AstNode<ast::FieldDefinition>,
        field: &ast::Field,
    ) -> Result<(), PlanningError> {
        let response_key = field.alias.as_ref().unwrap_or(&field.name).to_string();
        let frame_type = self
            .objects
            .last()
            .map(|frame| frame.type_name.clone())
            .unwrap_or_else(|| parent_type.clone());
        let enclosing_owner = self.enclosing_owner();

        let data_source = if field.name == "__typename" {
            None
        } else {
            self.configuration.data_source_for(parent_type, &field.name)
        };
        let (owner, root_of) = match data_source {
            Some(data_source)
                if enclosing_owner
                    .is_some_and(|owner| self.planners[owner].data_source == data_source) =>
            {
                (enclosing_owner, None)
            }
            Some(data_source) => {
                let sibling = self.objects.last().and_then(|frame| {
                    frame
                        .planners
                        .iter()
                        .copied()
                        .find(|&index| self.planners[index].data_source == data_source)
                });
                let index = match sibling {
                    Some(index) => index,
                    None => self.create_planner(data_source, enclosing_owner, parent_type)?,
                };
                (Some(index), Some(index))
            }
            None if enclosing_owner.is_some() => (enclosing_owner, None),
            None if self.fields.is_empty() && field.name != "__typename" => {
                return Err(PlanningError::MissingDataSource {
                    type_name: parent_type.to_string(),
                    field_name: field.name.to_string(),
                })
            }
            None => (None, None),
        };

        let frame = FieldFrame {
            path: self.path(parent_type, field, &response_key),
            ty: definition.ty.clone(),
            leaf: self.leaf(definition.ty.inner_named_type())?,
            owner,
            root_of,
            on_type_name: (*parent_type != frame_type).then(|| parent_type.to_string()),
            skip: skip_condition(&field.directives)
                .or_else(|| self.fragment_skips.iter().rev().flatten().next().cloned()),
            arguments: self.arguments(parent_type, definition, field),
            object: None,
            response_key,
        };
        if let Some(owner) = owner {
            let context = Self::field_context(&frame, parent_type, definition, field);
            self.planners[owner].sub_planner.enter_field(&context);
        }
        self.fields.push(frame);
        self.next_set = SetKind::Object;
        Ok(())
    }

    fn leave_field(
        &mut self,
        parent_type: &ast::NamedType,
        definition: &AstNode<ast::FieldDefinition>,
        field: &ast::Field,
    ) -> Result<(), PlanningError> {
        let Some(mut frame) = self.fields.pop() else {
            return Ok(());
        };
        if let Some(owner) = frame.owner {
            let context = Self::field_context(&frame, parent_type, definition, field);
            self.planners[owner].sub_planner.leave_field(&context);
        }

        let path = std::mem::take(&mut frame.path);
        let value = match frame.leaf {
            // no data source answers it
            _ if frame.owner.is_none() && field.name == "__typename" => {
                Node::StaticString(parent_type.to_string())
            }
            Some(leaf) => wrap(&frame.ty, path, |path, nullable| {
                let scalar = Scalar { path, nullable };
                match leaf {
                    Leaf::String => Node::String(scalar),
                    Leaf::Integer => Node::Integer(scalar),
                    Leaf::Float => Node::Float(scalar),
                    Leaf::Boolean => Node::Boolean(scalar),
                }
            }),
            None => {
                let object = frame.object.take().unwrap_or_default();
                wrap(&frame.ty, path, |path, nullable| {
                    Object {
                        path,
                        nullable,
                        ..object
                    }
                    .into()
                })
            }
        };

        let buffer_id = frame
            .root_of
            .and_then(|index| match self.planners[index].output {
                Output::Fetch(buffer_id) => Some(buffer_id),
                Output::Trigger => None,
            });
        if let Some(object) = self.objects.last_mut() {
            object.fields.push(Field {
                name: frame.response_key,
                value,
                buffer_id,
                on_type_name: frame.on_type_name,
                skip: frame.skip,
            });
        }
        Ok(())
    }

    fn enter_inline_fragment(
        &mut self,
        _parent_type: &ast::NamedType,
        type_condition: &ast::NamedType,
        fragment: &ast::InlineFragment,
    ) -> Result<(), PlanningError> {
        self.next_set = SetKind::Fragment;
        self.fragment_skips.push(skip_condition(&fragment.directives));
        if let Some(owner) = self.enclosing_owner() {
            self.planners[owner]
                .sub_planner
                .enter_inline_fragment(type_condition);
        }
        Ok(())
    }

    fn leave_inline_fragment(
        &mut self,
        _parent_type: &ast::NamedType,
        _type_condition: &ast::NamedType,
        _fragment: &ast::InlineFragment,
    ) -> Result<(), PlanningError> {
        self.fragment_skips.pop();
        if let Some(owner) = self.enclosing_owner() {
            self.planners[owner].sub_planner.leave_inline_fragment();
        }
        Ok(())
    }
}
