//! Endpoint definitions
//!
//! An endpoint is either a query (reads, cached per key, provides tags) or a
//! mutation (writes, never deduplicated, invalidates tags).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use crate::cache::tags::TagDescription;
use crate::error::{QueryCacheError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointKind {
    Query,
    Mutation,
}

impl fmt::Display for EndpointKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndpointKind::Query => write!(f, "query"),
            EndpointKind::Mutation => write!(f, "mutation"),
        }
    }
}

/// A read endpoint
#[derive(Debug, Clone)]
pub struct QueryDefinition {
    pub name: String,
    pub provides_tags: TagDescription,
    /// Overrides the API-wide retention window for this endpoint
    pub keep_unused_data_for: Option<Duration>,
}

impl QueryDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            provides_tags: TagDescription::Empty,
            keep_unused_data_for: None,
        }
    }

    pub fn provides_tags(mut self, tags: impl Into<TagDescription>) -> Self {
        self.provides_tags = tags.into();
        self
    }

    pub fn keep_unused_data_for(mut self, duration: Duration) -> Self {
        self.keep_unused_data_for = Some(duration);
        self
    }
}

/// A write endpoint
#[derive(Debug, Clone)]
pub struct MutationDefinition {
    pub name: String,
    pub invalidates_tags: TagDescription,
}

impl MutationDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            invalidates_tags: TagDescription::Empty,
        }
    }

    pub fn invalidates_tags(mut self, tags: impl Into<TagDescription>) -> Self {
        self.invalidates_tags = tags.into();
        self
    }
}

#[derive(Debug, Clone)]
pub enum EndpointDefinition {
    Query(QueryDefinition),
    Mutation(MutationDefinition),
}

impl EndpointDefinition {
    pub fn name(&self) -> &str {
        match self {
            EndpointDefinition::Query(def) => &def.name,
            EndpointDefinition::Mutation(def) => &def.name,
        }
    }

    pub fn kind(&self) -> EndpointKind {
        match self {
            EndpointDefinition::Query(_) => EndpointKind::Query,
            EndpointDefinition::Mutation(_) => EndpointKind::Mutation,
        }
    }
}

impl From<QueryDefinition> for EndpointDefinition {
    fn from(def: QueryDefinition) -> Self {
        EndpointDefinition::Query(def)
    }
}

impl From<MutationDefinition> for EndpointDefinition {
    fn from(def: MutationDefinition) -> Self {
        EndpointDefinition::Mutation(def)
    }
}

/// Registered endpoints, looked up by name
#[derive(Debug, Clone, Default)]
pub struct Endpoints {
    definitions: HashMap<String, EndpointDefinition>,
}

impl Endpoints {
    pub fn insert(&mut self, definition: EndpointDefinition) -> Result<()> {
        let name = definition.name().to_string();
        if self.definitions.contains_key(&name) {
            return Err(QueryCacheError::DuplicateEndpoint(name));
        }
        self.definitions.insert(name, definition);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<&EndpointDefinition> {
        self.definitions
            .get(name)
            .ok_or_else(|| QueryCacheError::UnknownEndpoint(name.to_string()))
    }

    pub fn query(&self, name: &str) -> Result<&QueryDefinition> {
        match self.get(name)? {
            EndpointDefinition::Query(def) => Ok(def),
            EndpointDefinition::Mutation(_) => Err(QueryCacheError::EndpointKindMismatch {
                endpoint: name.to_string(),
                expected: "query",
            }),
        }
    }

    pub fn mutation(&self, name: &str) -> Result<&MutationDefinition> {
        match self.get(name)? {
            EndpointDefinition::Mutation(def) => Ok(def),
            EndpointDefinition::Query(_) => Err(QueryCacheError::EndpointKindMismatch {
                endpoint: name.to_string(),
                expected: "mutation",
            }),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &EndpointDefinition> {
        self.definitions.values()
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }
}
