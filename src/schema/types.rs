//! Schema type definitions: entity types, relation types, cardinalities and
//! per-action policies.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::cache::SnippetCache;
use super::errors::{SchemaError, SchemaResult};
use super::permissions::{ActionPolicy, PermissionRule};

/// Value types an attribute relation may target.
pub const VALUE_TYPES: &[&str] = &["String", "Int", "Float", "Bool"];

/// Actions subject to permission checking.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Read,
    Add,
    Update,
    Delete,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Read => "read",
            Action::Add => "add",
            Action::Update => "update",
            Action::Delete => "delete",
        }
    }

    /// Extracts the action from a `has_<action>_permission` relation type.
    pub fn from_permission_rtype(rtype: &str) -> Option<Self> {
        let action = rtype
            .strip_prefix("has_")
            .and_then(|rest| rest.strip_suffix("_permission"))?;
        match action {
            "read" => Some(Action::Read),
            "add" => Some(Action::Add),
            "update" => Some(Action::Update),
            "delete" => Some(Action::Delete),
            _ => None,
        }
    }
}

/// How many times one side of a relation may occur for a fixed other side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Occurrence {
    /// Exactly one (`1`).
    One,
    /// Zero or one (`?`).
    Opt,
    /// One or more (`+`).
    AtLeastOne,
    /// Zero or more (`*`).
    Many,
}

impl Occurrence {
    fn from_char(c: char) -> Option<Self> {
        match c {
            '1' => Some(Occurrence::One),
            '?' => Some(Occurrence::Opt),
            '+' => Some(Occurrence::AtLeastOne),
            '*' => Some(Occurrence::Many),
            _ => None,
        }
    }

    /// True for `1` and `?`: at most one occurrence.
    pub fn is_single(&self) -> bool {
        matches!(self, Occurrence::One | Occurrence::Opt)
    }
}

/// Relation cardinality, written as two characters: objects-per-subject
/// first, subjects-per-object second (`?*`, `11`, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cardinality {
    pub object: Occurrence,
    pub subject: Occurrence,
}

impl Cardinality {
    pub fn parse(text: &str) -> SchemaResult<Self> {
        let mut chars = text.chars();
        match (chars.next(), chars.next(), chars.next()) {
            (Some(o), Some(s), None) => {
                match (Occurrence::from_char(o), Occurrence::from_char(s)) {
                    (Some(object), Some(subject)) => Ok(Self { object, subject }),
                    _ => Err(SchemaError::InvalidCardinality(text.to_string())),
                }
            }
            _ => Err(SchemaError::InvalidCardinality(text.to_string())),
        }
    }

    /// At most one object per subject: a rewrite may reuse an existing
    /// relation node over this edge without multiplying rows.
    pub fn single_valued_object(&self) -> bool {
        self.object.is_single()
    }
}

/// One (subject type, object type) definition of a relation type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationDef {
    pub subject: String,
    pub object: String,
    pub cardinality: Cardinality,
}

/// A relation type with its definitions and, for computed relations, the
/// rule expression defining it.
#[derive(Debug)]
pub struct RelationType {
    pub name: String,
    pub defs: Vec<RelationDef>,
    /// Defining rule of a computed (non-stored) relation; its snippet uses
    /// `S` and `O` for the relation's subject and object.
    pub rule: Option<Arc<PermissionRule>>,
}

impl RelationType {
    /// True if every definition targets a value type.
    pub fn is_attribute(&self) -> bool {
        !self.defs.is_empty()
            && self
                .defs
                .iter()
                .all(|def| VALUE_TYPES.contains(&def.object.as_str()))
    }

    /// True if the relation is rule-defined rather than stored.
    pub fn is_computed(&self) -> bool {
        self.rule.is_some()
    }

    /// True if every definition has a single-valued object side.
    pub fn single_valued_object(&self) -> bool {
        !self.defs.is_empty() && self.defs.iter().all(|d| d.cardinality.single_valued_object())
    }
}

/// An entity type and its per-action policies.
#[derive(Debug, Default)]
pub struct EntityDef {
    pub name: String,
    pub policies: BTreeMap<Action, ActionPolicy>,
}

/// The permission-carrying schema: entity types, relation types, computed
/// relations and the snippet cache all permission expressions are parsed
/// through.
///
/// Immutable once built; shared read-only across concurrently rewritten
/// queries. Reloading a schema means building a new instance, which drops
/// the old snippet cache with it.
#[derive(Debug, Default)]
pub struct Schema {
    name: String,
    entities: BTreeMap<String, EntityDef>,
    relations: BTreeMap<String, RelationType>,
    cache: SnippetCache,
}

impl Schema {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// True for the built-in value types.
    pub fn is_value_type(name: &str) -> bool {
        VALUE_TYPES.contains(&name)
    }

    /// Declares an entity type.
    pub fn add_entity(&mut self, name: impl Into<String>) -> SchemaResult<()> {
        let name = name.into();
        if self.entities.contains_key(&name) {
            return Err(SchemaError::DuplicateEntity(name));
        }
        self.entities.insert(
            name.clone(),
            EntityDef {
                name,
                policies: BTreeMap::new(),
            },
        );
        Ok(())
    }

    /// Declares a relation definition; subject must be a declared entity
    /// type, object a declared entity type or a value type.
    pub fn add_relation(
        &mut self,
        rtype: impl Into<String>,
        subject: impl Into<String>,
        object: impl Into<String>,
        cardinality: &str,
    ) -> SchemaResult<()> {
        let rtype = rtype.into();
        let subject = subject.into();
        let object = object.into();
        if !self.entities.contains_key(&subject) {
            return Err(SchemaError::UnknownEntity(subject));
        }
        if !self.entities.contains_key(&object) && !Self::is_value_type(&object) {
            return Err(SchemaError::UnknownEntity(object));
        }
        let cardinality = Cardinality::parse(cardinality)?;
        self.relations
            .entry(rtype.clone())
            .or_insert_with(|| RelationType {
                name: rtype,
                defs: Vec::new(),
                rule: None,
            })
            .defs
            .push(RelationDef {
                subject,
                object,
                cardinality,
            });
        Ok(())
    }

    /// Declares an attribute: a relation to a value type, at most one value
    /// per subject.
    pub fn add_attribute(
        &mut self,
        rtype: impl Into<String>,
        subject: impl Into<String>,
        value_type: &str,
    ) -> SchemaResult<()> {
        self.add_relation(rtype, subject, value_type, "?*")
    }

    /// Declares a computed relation defined by a rule expression over `S`
    /// and `O`.
    pub fn add_computed_relation(
        &mut self,
        rtype: impl Into<String>,
        subject: impl Into<String>,
        object: impl Into<String>,
        expression: &str,
    ) -> SchemaResult<()> {
        let rtype = rtype.into();
        self.add_relation(rtype.clone(), subject, object, "**")?;
        let rule = Arc::new(PermissionRule::new(expression, &mut self.cache)?);
        if let Some(relation) = self.relations.get_mut(&rtype) {
            relation.rule = Some(rule);
        }
        Ok(())
    }

    /// Sets an explicit policy for an action on an entity type.
    pub fn set_policy(
        &mut self,
        etype: &str,
        action: Action,
        policy: ActionPolicy,
    ) -> SchemaResult<()> {
        let entity = self
            .entities
            .get_mut(etype)
            .ok_or_else(|| SchemaError::UnknownEntity(etype.to_string()))?;
        entity.policies.insert(action, policy);
        Ok(())
    }

    /// Guards an action on an entity type with disjunctive rule
    /// expressions.
    pub fn guard(
        &mut self,
        etype: &str,
        action: Action,
        expressions: &[&str],
    ) -> SchemaResult<()> {
        let mut rules = Vec::with_capacity(expressions.len());
        for expression in expressions {
            rules.push(Arc::new(PermissionRule::new(*expression, &mut self.cache)?));
        }
        self.set_policy(etype, action, ActionPolicy::Guarded(rules))
    }

    /// Policy for an action on an entity type; absent policies default to
    /// `Allow`.
    pub fn policy(&self, etype: &str, action: Action) -> &ActionPolicy {
        static ALLOW: ActionPolicy = ActionPolicy::Allow;
        self.entities
            .get(etype)
            .and_then(|e| e.policies.get(&action))
            .unwrap_or(&ALLOW)
    }

    pub fn has_entity(&self, name: &str) -> bool {
        self.entities.contains_key(name)
    }

    pub fn entity_types(&self) -> impl Iterator<Item = &str> {
        self.entities.keys().map(String::as_str)
    }

    pub fn relation(&self, rtype: &str) -> Option<&RelationType> {
        self.relations.get(rtype)
    }

    /// The snippet cache, for constructing rules against this schema.
    pub fn cache_mut(&mut self) -> &mut SnippetCache {
        &mut self.cache
    }

    pub fn cache(&self) -> &SnippetCache {
        &self.cache
    }
}
