//! Fetch input templates.
//!
//! A template is a list of static segments and variable references. Sub-planners write their
//! inputs as strings with `$$<index>$$` placeholders referencing a list of [`Variable`]s, which
//! keeps plans readable; [`InputTemplate::parse`] turns them into segments once at plan time.
use std::borrow::Cow;
use std::fmt;

use bytes::BufMut;
use bytes::Bytes;
use bytes::BytesMut;
use serde_json_bytes::Value;

use crate::error::FetchError;
use crate::json_ext::ValueExt;
use crate::Context;

/// Where a variable reads its value from.
#[derive(Clone, Debug, PartialEq)]
pub enum VariableSource {
    /// The operation variables.
    Context,
    /// The JSON of the object the fetch is attached to.
    Object,
    /// A request header, rendered as a string.
    Header,
    /// A constant.
    Static(Value),
}

/// How a variable value is written into the input.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum Rendering {
    /// The JSON value as is.
    #[default]
    Raw,
    /// The value escaped for placement inside a JSON string.
    Escaped,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Variable {
    pub source: VariableSource,
    pub path: Vec<String>,
    pub rendering: Rendering,
}

impl Variable {
    pub fn context<I, S>(path: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(VariableSource::Context, path)
    }

    pub fn object<I, S>(path: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(VariableSource::Object, path)
    }

    pub fn header(name: impl Into<String>) -> Self {
        Self::new(VariableSource::Header, [name.into()])
    }

    pub fn constant(value: impl Into<Value>) -> Self {
        Self::new(VariableSource::Static(value.into()), Vec::<String>::new())
    }

    fn new<I, S>(source: VariableSource, path: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            source,
            path: path.into_iter().map(Into::into).collect(),
            rendering: Rendering::Raw,
        }
    }

    pub fn escaped(mut self) -> Self {
        self.rendering = Rendering::Escaped;
        self
    }

    fn name(&self) -> String {
        let prefix = match self.source {
            VariableSource::Context => "variables",
            VariableSource::Object => "object",
            VariableSource::Header => "headers",
            VariableSource::Static(_) => "static",
        };
        std::iter::once(prefix)
            .chain(self.path.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(".")
    }

    fn resolve<'a>(
        &'a self,
        context: &'a Context,
        parent: &'a Value,
    ) -> Result<Cow<'a, Value>, FetchError> {
        let missing = || FetchError::TemplateVariableMissing { name: self.name() };
        match &self.source {
            VariableSource::Context => context
                .variables()
                .get_path(&self.path)
                .map(Cow::Borrowed)
                .ok_or_else(missing),
            VariableSource::Object => parent
                .get_path(&self.path)
                .map(Cow::Borrowed)
                .ok_or_else(missing),
            VariableSource::Header => {
                let name = self.path.first().ok_or_else(missing)?;
                let header = context.headers().get(name).ok_or_else(missing)?;
                let header = header.to_str().map_err(|err| FetchError::MalformedInput {
                    reason: format!("header '{name}' is not valid UTF-8: {err}"),
                })?;
                Ok(Cow::Owned(Value::from(header)))
            }
            VariableSource::Static(value) => Ok(Cow::Borrowed(value)),
        }
    }

    fn render(
        &self,
        context: &Context,
        parent: &Value,
        out: &mut BytesMut,
    ) -> Result<(), FetchError> {
        let value = self.resolve(context, parent)?;
        let json = match (self.rendering, value.as_ref()) {
            (Rendering::Escaped, Value::String(s)) => serde_json::to_string(s.as_str()),
            (Rendering::Escaped, other) => {
                serde_json::to_string(other).and_then(|text| serde_json::to_string(&text))
            }
            (Rendering::Raw, other) => serde_json::to_string(other),
        }
        .map_err(|err| FetchError::MalformedInput {
            reason: err.to_string(),
        })?;

        match self.rendering {
            // strip the quotes of the JSON string
            Rendering::Escaped => out.put_slice(&json.as_bytes()[1..json.len() - 1]),
            Rendering::Raw => out.put_slice(json.as_bytes()),
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum TemplateSegment {
    Static(Bytes),
    Variable(Variable),
}

/// Renders the input of a fetch.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct InputTemplate {
    pub segments: Vec<TemplateSegment>,
}

impl InputTemplate {
    /// Splits `input` on `$$<index>$$` placeholders referencing `variables`.
    ///
    /// Placeholders with an index outside of `variables` are kept as static text.
    pub fn parse(input: &str, variables: &[Variable]) -> Self {
        let mut segments = Vec::new();
        let mut rest = input;
        let mut pending = String::new();
        while let Some(start) = rest.find("$$") {
            let after = &rest[start + 2..];
            let digits = after
                .find(|c: char| !c.is_ascii_digit())
                .unwrap_or(after.len());
            let variable = after[digits..]
                .starts_with("$$")
                .then(|| after[..digits].parse::<usize>().ok())
                .flatten()
                .and_then(|index| variables.get(index));

            match variable {
                Some(variable) => {
                    pending.push_str(&rest[..start]);
                    if !pending.is_empty() {
                        segments.push(TemplateSegment::Static(Bytes::from(std::mem::take(
                            &mut pending,
                        ))));
                    }
                    segments.push(TemplateSegment::Variable(variable.clone()));
                    rest = &after[digits + 2..];
                }
                None => {
                    pending.push_str(&rest[..start + 2]);
                    rest = after;
                }
            }
        }
        pending.push_str(rest);
        if !pending.is_empty() {
            segments.push(TemplateSegment::Static(Bytes::from(pending)));
        }
        Self { segments }
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Renders the template against the context and the JSON of the current object.
    pub fn render(
        &self,
        context: &Context,
        parent: &Value,
        out: &mut BytesMut,
    ) -> Result<(), FetchError> {
        for segment in &self.segments {
            match segment {
                TemplateSegment::Static(bytes) => out.put_slice(bytes),
                TemplateSegment::Variable(variable) => variable.render(context, parent, out)?,
            }
        }
        Ok(())
    }
}

/// Prints the template back with placeholders, numbering variables in order of first use.
impl fmt::Display for InputTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut seen: Vec<&Variable> = Vec::new();
        for segment in &self.segments {
            match segment {
                TemplateSegment::Static(bytes) => f.write_str(&String::from_utf8_lossy(bytes))?,
                TemplateSegment::Variable(variable) => {
                    let index = match seen.iter().position(|known| *known == variable) {
                        Some(index) => index,
                        None => {
                            seen.push(variable);
                            seen.len() - 1
                        }
                    };
                    write!(f, "$${index}$$")?;
                }
            }
        }
        Ok(())
    }
}
