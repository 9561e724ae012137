use serde_json_bytes::Value;

use crate::json_ext::ValueExt;
use crate::resolve::fetch::Fetch;
use crate::Context;

/// A node of a response plan.
#[derive(Clone, Debug, PartialEq)]
pub enum Node {
    Object(Object),
    Array(Array),
    String(Scalar),
    Integer(Scalar),
    Float(Scalar),
    Boolean(Scalar),
    /// Always `null`.
    Null,
    /// Always `{}`.
    EmptyObject,
    /// Always this string.
    StaticString(String),
}

/// A leaf value read at `path`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Scalar {
    pub path: Vec<String>,
    pub nullable: bool,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Object {
    /// Where to read the object from. An empty path uses the current value.
    pub path: Vec<String>,
    pub nullable: bool,
    pub fields: Vec<Field>,
    /// Runs before the fields are resolved; its buffers feed fields with a `buffer_id`.
    pub fetch: Option<Fetch>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Array {
    pub path: Vec<String>,
    pub nullable: bool,
    /// Resolve items concurrently.
    pub resolve_asynchronous: bool,
    pub item: Box<Node>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Field {
    /// The output key.
    pub name: String,
    pub value: Node,
    /// Read the value from this buffer instead of the object.
    pub buffer_id: Option<usize>,
    /// Only write the field when the `__typename` of the source matches.
    pub on_type_name: Option<String>,
    pub skip: Option<SkipCondition>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum SkipCondition {
    /// Skip when the `__typename` of the source differs.
    TypeNameNotEqual(String),
    /// Skip when the boolean operation variable at `path` equals `skip_if`.
    ///
    /// An absent variable counts as `false`.
    Variable { path: Vec<String>, skip_if: bool },
}

impl SkipCondition {
    pub(crate) fn applies(&self, context: &Context, source: &Value) -> bool {
        match self {
            SkipCondition::TypeNameNotEqual(type_name) => {
                source.type_name() != Some(type_name.as_str())
            }
            SkipCondition::Variable { path, skip_if } => {
                let value = context
                    .variables()
                    .get_path(path)
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                value == *skip_if
            }
        }
    }
}

fn to_path<I, S>(path: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    path.into_iter().map(Into::into).collect()
}

impl Scalar {
    pub fn at<I, S>(path: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            path: to_path(path),
            nullable: false,
        }
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }
}

impl Object {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn at<I, S>(mut self, path: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.path = to_path(path);
        self
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    pub fn field(mut self, field: Field) -> Self {
        self.fields.push(field);
        self
    }

    pub fn fetch(mut self, fetch: Fetch) -> Self {
        self.fetch = Some(fetch);
        self
    }
}

impl Array {
    pub fn of(item: Node) -> Self {
        Self {
            path: Vec::new(),
            nullable: false,
            resolve_asynchronous: false,
            item: Box::new(item),
        }
    }

    pub fn at<I, S>(mut self, path: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.path = to_path(path);
        self
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    pub fn asynchronous(mut self) -> Self {
        self.resolve_asynchronous = true;
        self
    }
}

impl Field {
    pub fn new(name: impl Into<String>, value: Node) -> Self {
        Self {
            name: name.into(),
            value,
            buffer_id: None,
            on_type_name: None,
            skip: None,
        }
    }

    pub fn buffer(mut self, buffer_id: usize) -> Self {
        self.buffer_id = Some(buffer_id);
        self
    }

    pub fn on_type_name(mut self, type_name: impl Into<String>) -> Self {
        self.on_type_name = Some(type_name.into());
        self
    }

    pub fn skip(mut self, condition: SkipCondition) -> Self {
        self.skip = Some(condition);
        self
    }
}

impl From<Object> for Node {
    fn from(object: Object) -> Self {
        Node::Object(object)
    }
}

impl From<Array> for Node {
    fn from(array: Array) -> Self {
        Node::Array(array)
    }
}
