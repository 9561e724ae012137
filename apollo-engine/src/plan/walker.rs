//! Recursive descent over an operation.
//!
//! The walker emits Enter/Leave events for the document, the selected operation, selection
//! sets, fields and inline fragments. A Leave event for a node always directly follows the
//! Leave events of its children. Fragment spreads are ignored: operations are expected to be
//! normalized. Selections excluded by a literal `@skip(if: true)` or `@include(if: false)` are
//! not visited.
use apollo_compiler::ast;
use apollo_compiler::ast::OperationType;
use apollo_compiler::name;
use apollo_compiler::schema::FieldLookupError;
use apollo_compiler::Node;
use once_cell::sync::Lazy;

use crate::error::PlanningError;

static TYPENAME_DEFINITION: Lazy<Node<ast::FieldDefinition>> = Lazy::new(|| {
    Node::new(ast::FieldDefinition {
        description: None,
        name: name!("__typename"),
        arguments: Vec::new(),
        ty: ast::Type::NonNullNamed(name!("String")),
        directives: Default::default(),
    })
});

/// Walk events. Returning an `Err` from any callback aborts the walk.
pub trait Visitor {
    fn schema(&self) -> &apollo_compiler::Schema;

    fn enter_document(&mut self, _document: &ast::Document) -> Result<(), PlanningError> {
        Ok(())
    }

    fn leave_document(&mut self, _document: &ast::Document) -> Result<(), PlanningError> {
        Ok(())
    }

    fn enter_operation(
        &mut self,
        _root_type: &ast::NamedType,
        _operation: &ast::OperationDefinition,
    ) -> Result<(), PlanningError> {
        Ok(())
    }

    fn leave_operation(
        &mut self,
        _root_type: &ast::NamedType,
        _operation: &ast::OperationDefinition,
    ) -> Result<(), PlanningError> {
        Ok(())
    }

    /// `parent_type` is the type the selections apply to.
    fn enter_selection_set(&mut self, _parent_type: &ast::NamedType) -> Result<(), PlanningError> {
        Ok(())
    }

    fn leave_selection_set(&mut self, _parent_type: &ast::NamedType) -> Result<(), PlanningError> {
        Ok(())
    }

    fn enter_field(
        &mut self,
        _parent_type: &ast::NamedType,
        _definition: &Node<ast::FieldDefinition>,
        _field: &ast::Field,
    ) -> Result<(), PlanningError> {
        Ok(())
    }

    fn leave_field(
        &mut self,
        _parent_type: &ast::NamedType,
        _definition: &Node<ast::FieldDefinition>,
        _field: &ast::Field,
    ) -> Result<(), PlanningError> {
        Ok(())
    }

    /// `type_condition` is the condition of the fragment, or `parent_type` without one.
    fn enter_inline_fragment(
        &mut self,
        _parent_type: &ast::NamedType,
        _type_condition: &ast::NamedType,
        _fragment: &ast::InlineFragment,
    ) -> Result<(), PlanningError> {
        Ok(())
    }

    fn leave_inline_fragment(
        &mut self,
        _parent_type: &ast::NamedType,
        _type_condition: &ast::NamedType,
        _fragment: &ast::InlineFragment,
    ) -> Result<(), PlanningError> {
        Ok(())
    }
}

/// Selects the operation to walk.
///
/// Without a name the document must contain exactly one operation.
pub fn operation<'doc>(
    document: &'doc ast::Document,
    operation_name: Option<&str>,
) -> Result<&'doc Node<ast::OperationDefinition>, PlanningError> {
    let mut operations = document.definitions.iter().filter_map(|def| match def {
        ast::Definition::OperationDefinition(operation) => Some(operation),
        _ => None,
    });
    match operation_name {
        Some(name) => operations
            .find(|operation| operation.name.as_deref() == Some(name))
            .ok_or_else(|| PlanningError::UnknownOperation(name.to_string())),
        None => {
            let first = operations
                .next()
                .ok_or_else(|| PlanningError::UnknownOperation(String::new()))?;
            match operations.next() {
                Some(_) => Err(PlanningError::AmbiguousOperation),
                None => Ok(first),
            }
        }
    }
}

/// Walks the selected operation of `document` with `visitor`.
pub fn document(
    visitor: &mut impl Visitor,
    document: &ast::Document,
    operation_name: Option<&str>,
) -> Result<(), PlanningError> {
    let operation = operation(document, operation_name)?;
    let root_type = visitor
        .schema()
        .root_operation(operation.operation_type)
        .ok_or_else(|| {
            PlanningError::MissingRootOperation(operation_kind(operation.operation_type))
        })?
        .clone();

    visitor.enter_document(document)?;
    visitor.enter_operation(&root_type, operation)?;
    selection_set(visitor, &root_type, &operation.selection_set)?;
    visitor.leave_operation(&root_type, operation)?;
    visitor.leave_document(document)
}

pub(crate) fn operation_kind(operation_type: OperationType) -> String {
    match operation_type {
        OperationType::Query => "query",
        OperationType::Mutation => "mutation",
        OperationType::Subscription => "subscription",
    }
    .to_string()
}

fn selection_set(
    visitor: &mut impl Visitor,
    parent_type: &ast::NamedType,
    set: &[ast::Selection],
) -> Result<(), PlanningError> {
    visitor.enter_selection_set(parent_type)?;
    for selection in set {
        match selection {
            ast::Selection::Field(field) => {
                if excluded(&field.directives) {
                    continue;
                }
                let definition = field_definition(visitor.schema(), parent_type, field)?;
                visitor.enter_field(parent_type, &definition, field)?;
                if !field.selection_set.is_empty() {
                    selection_set(
                        visitor,
                        definition.ty.inner_named_type(),
                        &field.selection_set,
                    )?;
                }
                visitor.leave_field(parent_type, &definition, field)?;
            }
            ast::Selection::InlineFragment(fragment) => {
                if excluded(&fragment.directives) {
                    continue;
                }
                let type_condition = fragment.type_condition.as_ref().unwrap_or(parent_type);
                visitor.enter_inline_fragment(parent_type, type_condition, fragment)?;
                selection_set(visitor, type_condition, &fragment.selection_set)?;
                visitor.leave_inline_fragment(parent_type, type_condition, fragment)?;
            }
            ast::Selection::FragmentSpread(_) => {}
        }
    }
    visitor.leave_selection_set(parent_type)
}

fn field_definition(
    schema: &apollo_compiler::Schema,
    parent_type: &ast::NamedType,
    field: &ast::Field,
) -> Result<Node<ast::FieldDefinition>, PlanningError> {
    if field.name == "__typename" {
        return Ok(TYPENAME_DEFINITION.clone());
    }
    schema
        .type_field(parent_type, &field.name)
        .map(|definition| definition.node.clone())
        .map_err(|err| match err {
            FieldLookupError::NoSuchType => PlanningError::UnknownType(parent_type.to_string()),
            FieldLookupError::NoSuchField(..) => PlanningError::UnknownField {
                type_name: parent_type.to_string(),
                field_name: field.name.to_string(),
            },
        })
}

/// The value of the `if` argument of a directive, when it is a literal.
pub(crate) fn literal_condition(directive: &ast::Directive) -> Option<bool> {
    directive
        .arguments
        .iter()
        .find(|argument| argument.name == "if")
        .and_then(|argument| match &*argument.value {
            ast::Value::Boolean(condition) => Some(*condition),
            _ => None,
        })
}

fn excluded(directives: &ast::DirectiveList) -> bool {
    let skipped = directives
        .get("skip")
        .and_then(|directive| literal_condition(directive))
        == Some(true);
    let not_included = directives
        .get("include")
        .and_then(|directive| literal_condition(directive))
        == Some(false);
    skipped || not_included
}
