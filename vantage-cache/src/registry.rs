//! Static routing table for queries, entities and mutations.
//!
//! The registry is built once at startup and validated before any cache
//! component uses it. It answers three questions:
//!
//! - which query descriptors exist, keyed by `(resource, operation)`, and
//!   what shape their cached value has ([`QueryShape`]);
//! - which resources belong to a logical entity (e.g. `appointment` list and
//!   detail queries both belong to `appointments`);
//! - which entities a mutation invalidates.
//!
//! Name lookups never index dynamically at call time: an unknown name is a
//! [`RegistryError`].

use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use vantage_core::{CacheKey, FilterExpr, RegistryError, SortSpec};

/// Declared shape of a list query's cached value.
#[derive(Debug, Clone, PartialEq)]
pub struct ListShape {
    /// Field identifying rows within the list.
    pub id_field: String,
    /// Rows the list may contain; inserted rows must satisfy it.
    pub filter: Option<FilterExpr>,
    /// Order the server returns rows in.
    pub sort: Option<SortSpec>,
    /// Query parameters that select rows, by parameter name: a row belongs
    /// to the list only if `row[field] == params[param]`. A cached key
    /// carrying a parameter missing here cannot be folded.
    pub param_fields: BTreeMap<String, String>,
}

impl ListShape {
    /// Bind query parameter `param` to row field `field`.
    pub fn bind_param(mut self, param: impl Into<String>, field: impl Into<String>) -> Self {
        self.param_fields.insert(param.into(), field.into());
        self
    }
}

impl Default for ListShape {
    fn default() -> Self {
        Self {
            id_field: "id".to_string(),
            filter: None,
            sort: None,
            param_fields: BTreeMap::new(),
        }
    }
}

/// Tagged description of how a query's cached value can be folded.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryShape {
    /// An array of rows.
    List(ListShape),
    /// A single row addressed by the `id_param` input parameter.
    Detail { id_param: String },
    /// A derived value (counts, statistics) that can only be refetched.
    Aggregate,
}

impl QueryShape {
    pub fn list() -> Self {
        QueryShape::List(ListShape::default())
    }

    pub fn list_with(filter: Option<FilterExpr>, sort: Option<SortSpec>) -> Self {
        QueryShape::List(ListShape {
            filter,
            sort,
            ..ListShape::default()
        })
    }

    /// Bind a list query's parameter to a row field. No effect on other
    /// shapes.
    pub fn bind_param(self, param: impl Into<String>, field: impl Into<String>) -> Self {
        match self {
            QueryShape::List(list) => QueryShape::List(list.bind_param(param, field)),
            other => other,
        }
    }

    pub fn detail(id_param: impl Into<String>) -> Self {
        QueryShape::Detail {
            id_param: id_param.into(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            QueryShape::List(_) => "list",
            QueryShape::Detail { .. } => "detail",
            QueryShape::Aggregate => "aggregate",
        }
    }
}

/// A registered query.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryDescriptor {
    pub resource: String,
    pub operation: String,
    pub shape: QueryShape,
}

/// A registered mutation.
#[derive(Debug, Clone, PartialEq)]
pub struct MutationDescriptor {
    pub name: String,
    /// Remote procedure invoked by the mutation.
    pub procedure: String,
    /// Entities whose cached queries are stale after the mutation commits.
    pub affects: Vec<String>,
}

/// Builder for [`Registry`]. All validation happens in [`RegistryBuilder::build`].
#[derive(Debug, Default)]
pub struct RegistryBuilder {
    entities: BTreeMap<String, BTreeSet<String>>,
    queries: Vec<QueryDescriptor>,
    mutations: BTreeMap<String, MutationDescriptor>,
}

impl RegistryBuilder {
    /// Declare an entity and the resources that belong to it.
    pub fn entity<I, S>(mut self, entity: impl Into<String>, resources: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.entities
            .entry(entity.into())
            .or_default()
            .extend(resources.into_iter().map(Into::into));
        self
    }

    /// Declare a query descriptor.
    pub fn query(
        mut self,
        resource: impl Into<String>,
        operation: impl Into<String>,
        shape: QueryShape,
    ) -> Self {
        self.queries.push(QueryDescriptor {
            resource: resource.into(),
            operation: operation.into(),
            shape,
        });
        self
    }

    /// Declare a mutation and the remote procedure it calls.
    pub fn mutation(mut self, name: impl Into<String>, procedure: impl Into<String>) -> Self {
        let name = name.into();
        let procedure = procedure.into();
        self.mutations
            .entry(name.clone())
            .and_modify(|m| m.procedure = procedure.clone())
            .or_insert(MutationDescriptor {
                name,
                procedure,
                affects: Vec::new(),
            });
        self
    }

    /// Map a mutation to the entities it invalidates. A mutation declared only
    /// here calls a procedure of the same name.
    pub fn register_dependency<I, S>(mut self, mutation: impl Into<String>, affected: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let name = mutation.into();
        let descriptor = self
            .mutations
            .entry(name.clone())
            .or_insert_with(|| MutationDescriptor {
                name: name.clone(),
                procedure: name,
                affects: Vec::new(),
            });
        for entity in affected {
            let entity = entity.into();
            if !descriptor.affects.contains(&entity) {
                descriptor.affects.push(entity);
            }
        }
        self
    }

    /// Validate and freeze the routing table.
    pub fn build(self) -> Result<Registry, RegistryError> {
        let mut resource_entities: HashMap<String, Vec<String>> = HashMap::new();
        for (entity, resources) in &self.entities {
            for resource in resources {
                resource_entities
                    .entry(resource.clone())
                    .or_default()
                    .push(entity.clone());
            }
        }

        let mut queries = HashMap::with_capacity(self.queries.len());
        for descriptor in self.queries {
            if !resource_entities.contains_key(&descriptor.resource) {
                return Err(RegistryError::OrphanResource {
                    resource: descriptor.resource,
                });
            }
            validate_shape(&descriptor)?;
            let slot = (descriptor.resource.clone(), descriptor.operation.clone());
            if queries.contains_key(&slot) {
                return Err(RegistryError::DuplicateQuery {
                    resource: descriptor.resource,
                    operation: descriptor.operation,
                });
            }
            queries.insert(slot, descriptor);
        }

        for mutation in self.mutations.values() {
            for entity in &mutation.affects {
                if !self.entities.contains_key(entity) {
                    return Err(RegistryError::UnknownEntity {
                        entity: entity.clone(),
                        referenced_by: format!("mutation {}", mutation.name),
                    });
                }
            }
        }

        Ok(Registry {
            entities: self.entities,
            resource_entities,
            queries,
            mutations: self.mutations,
        })
    }
}

fn validate_shape(descriptor: &QueryDescriptor) -> Result<(), RegistryError> {
    let reason = match &descriptor.shape {
        QueryShape::List(list) if list.id_field.trim().is_empty() => "list id_field must not be empty",
        QueryShape::List(list)
            if list
                .param_fields
                .iter()
                .any(|(param, field)| param.trim().is_empty() || field.trim().is_empty()) =>
        {
            "list parameter bindings must name a parameter and a field"
        }
        QueryShape::Detail { id_param } if id_param.trim().is_empty() => {
            "detail id_param must not be empty"
        }
        _ => return Ok(()),
    };
    Err(RegistryError::InvalidDescriptor {
        resource: descriptor.resource.clone(),
        operation: descriptor.operation.clone(),
        reason: reason.to_string(),
    })
}

/// Validated, immutable routing table.
#[derive(Debug, Clone)]
pub struct Registry {
    entities: BTreeMap<String, BTreeSet<String>>,
    resource_entities: HashMap<String, Vec<String>>,
    queries: HashMap<(String, String), QueryDescriptor>,
    mutations: BTreeMap<String, MutationDescriptor>,
}

impl Registry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    /// Resolve a query descriptor.
    pub fn descriptor(&self, resource: &str, operation: &str) -> Result<&QueryDescriptor, RegistryError> {
        self.queries
            .get(&(resource.to_string(), operation.to_string()))
            .ok_or_else(|| RegistryError::UnknownQuery {
                resource: resource.to_string(),
                operation: operation.to_string(),
            })
    }

    /// Build a cache key for a registered query.
    pub fn key(&self, resource: &str, operation: &str, params: Value) -> Result<CacheKey, RegistryError> {
        let descriptor = self.descriptor(resource, operation)?;
        Ok(CacheKey::new(
            descriptor.resource.clone(),
            descriptor.operation.clone(),
            params,
        ))
    }

    /// Shape of the query a key was built for.
    pub fn shape_of(&self, key: &CacheKey) -> Option<&QueryShape> {
        self.queries
            .get(&(key.resource().to_string(), key.operation().to_string()))
            .map(|d| &d.shape)
    }

    /// Resolve a mutation descriptor.
    pub fn mutation(&self, name: &str) -> Result<&MutationDescriptor, RegistryError> {
        self.mutations
            .get(name)
            .ok_or_else(|| RegistryError::UnknownMutation {
                name: name.to_string(),
            })
    }

    pub fn has_entity(&self, entity: &str) -> bool {
        self.entities.contains_key(entity)
    }

    /// Resources belonging to `entity`.
    pub fn resources_of(&self, entity: &str) -> Result<Vec<&str>, RegistryError> {
        self.entities
            .get(entity)
            .map(|resources| resources.iter().map(String::as_str).collect())
            .ok_or_else(|| RegistryError::UnknownEntity {
                entity: entity.to_string(),
                referenced_by: "lookup".to_string(),
            })
    }

    /// Entities that claim `resource`.
    pub fn entities_of(&self, resource: &str) -> &[String] {
        self.resource_entities
            .get(resource)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn entities(&self) -> impl Iterator<Item = &str> {
        self.entities.keys().map(String::as_str)
    }
}
