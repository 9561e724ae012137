//! Logic for loading configuration in to an object model
//!
//! The configuration tells the planner which data source owns which root fields, how field
//! values are mapped out of upstream responses, where field arguments come from and which fields
//! a nested fetch needs from its parent.
use std::collections::HashSet;
use std::str::FromStr;

use displaydoc::Display;
use schemars::gen::SchemaSettings;
use schemars::schema::RootSchema;
use schemars::JsonSchema;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;


/// Configuration error.
#[derive(Debug, Error, Display)]
#[non_exhaustive]
pub enum ConfigurationError {
    /// could not deserialize configuration: {0}
    DeserializeConfigError(serde_yaml::Error),
    /// {message}: {error}
    InvalidConfiguration {
        message: &'static str,
        error: String,
    },
}

/// The configuration for the engine.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(deny_unknown_fields, default)]
pub struct Configuration {
    /// Data sources and the root fields they serve.
    pub data_sources: Vec<DataSourceConfiguration>,

    /// Per-field mapping and argument configuration.
    pub fields: Vec<FieldConfiguration>,

    /// Fields a nested fetch needs from the object it is nested in.
    pub dependencies: Vec<FieldDependency>,

    /// Resolver configuration.
    pub resolver: ResolverConfiguration,
}

/// A data source and the fields it serves.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct DataSourceConfiguration {
    /// Selects the registered planner factory, for example `graphql` or `rest`.
    pub kind: String,

    /// Fields starting a fetch on this data source.
    pub root_nodes: Vec<TypeFields>,

    /// Data source specific configuration, decoded by its planner.
    #[serde(default)]
    pub custom: serde_json::Value,
}

/// A type and some of its fields.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct TypeFields {
    pub type_name: String,
    pub field_names: Vec<String>,
}

/// Mapping and argument configuration of a single field.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct FieldConfiguration {
    pub type_name: String,
    pub field_name: String,

    /// Read the value from the current object instead of a key named after the field.
    #[serde(default)]
    pub disable_default_mapping: bool,

    /// Read the value at this path instead of a key named after the field.
    #[serde(default)]
    pub path: Option<Vec<String>>,

    /// Where the arguments sent upstream come from.
    ///
    /// When empty, every argument present in the operation is forwarded.
    #[serde(default)]
    pub arguments: Vec<ArgumentConfiguration>,
}

/// The source of an argument sent upstream.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct ArgumentConfiguration {
    pub name: String,

    #[serde(default)]
    pub source: ArgumentSource,

    /// Path into the parent object or the operation variables.
    #[serde(default)]
    pub source_path: Vec<String>,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ArgumentSource {
    /// The argument as written in the operation.
    #[default]
    FieldArgument,
    /// A field of the parent object.
    ObjectField,
    /// An operation variable.
    ContextVariable,
}

/// Fields of `type_name` a nested fetch needs from the data source owning the object.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct FieldDependency {
    pub type_name: String,
    pub required_fields: Vec<String>,
}

/// Resolver configuration.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(deny_unknown_fields, default)]
pub struct ResolverConfiguration {
    /// Collapse identical concurrent fetches into one load.
    pub single_flight: bool,

    /// Number of idle buffers kept for reuse.
    pub pool_size: usize,
}

impl Default for ResolverConfiguration {
    fn default() -> Self {
        Self {
            single_flight: true,
            pool_size: 64,
        }
    }
}

impl Configuration {
    /// The index of the data source serving `type_name.field_name` as a root node.
    pub(crate) fn data_source_for(&self, type_name: &str, field_name: &str) -> Option<usize> {
        self.data_sources.iter().position(|data_source| {
            data_source.root_nodes.iter().any(|node| {
                node.type_name == type_name
                    && node.field_names.iter().any(|name| name == field_name)
            })
        })
    }

    pub(crate) fn field(&self, type_name: &str, field_name: &str) -> Option<&FieldConfiguration> {
        self.fields
            .iter()
            .find(|field| field.type_name == type_name && field.field_name == field_name)
    }

    pub(crate) fn required_fields<'s>(
        &'s self,
        type_name: &'s str,
    ) -> impl Iterator<Item = &'s str> + 's {
        self.dependencies
            .iter()
            .filter(move |dependency| dependency.type_name == type_name)
            .flat_map(|dependency| dependency.required_fields.iter().map(String::as_str))
    }

    /// Checks what serde cannot: a root node is served by a single data source.
    pub fn validate(self) -> Result<Self, ConfigurationError> {
        let mut seen = HashSet::new();
        for data_source in &self.data_sources {
            for node in &data_source.root_nodes {
                for field_name in &node.field_names {
                    if !seen.insert((node.type_name.as_str(), field_name.as_str())) {
                        return Err(ConfigurationError::InvalidConfiguration {
                            message: "root node is served by several data sources",
                            error: format!("{}.{}", node.type_name, field_name),
                        });
                    }
                }
            }
        }
        Ok(self)
    }
}

impl FromStr for Configuration {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_yaml::from_str::<Configuration>(s)
            .map_err(ConfigurationError::DeserializeConfigError)?
            .validate()
    }
}

/// Generate a JSON schema for the configuration.
pub fn generate_config_schema() -> RootSchema {
    let settings = SchemaSettings::draft07().with(|s| {
        s.option_nullable = true;
        s.option_add_null_type = false;
        s.inline_subschemas = true;
    });

    let generator = settings.into_generator();
    generator.into_root_schema_for::<Configuration>()
}
