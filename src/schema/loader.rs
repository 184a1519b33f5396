//! Schema loader for loading permission schemas from disk at startup.
//!
//! One JSON document per schema, stored at `<data_dir>/schemas/<name>.json`.
//! Malformed or duplicate schema files are load failures; schemas are
//! immutable once registered.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::errors::{SchemaError, SchemaResult};
use super::permissions::{ActionPolicy, PermissionRule};
use super::types::{Action, Schema};

/// On-disk policy form.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum PolicyDoc {
    /// No restriction.
    Allow,
    /// Never allowed.
    Deny,
    /// Allowed for rows matching at least one rule expression.
    Guarded { rules: Vec<String> },
}

/// On-disk entity declaration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityDoc {
    pub name: String,
    #[serde(default)]
    pub permissions: BTreeMap<Action, PolicyDoc>,
}

/// On-disk relation declaration. `rule` marks a computed relation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelationDoc {
    pub name: String,
    pub subject: String,
    pub object: String,
    #[serde(default = "default_cardinality")]
    pub cardinality: String,
    #[serde(default)]
    pub rule: Option<String>,
}

fn default_cardinality() -> String {
    "**".to_string()
}

/// On-disk schema document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaDocument {
    pub name: String,
    #[serde(default)]
    pub entities: Vec<EntityDoc>,
    #[serde(default)]
    pub relations: Vec<RelationDoc>,
}

impl SchemaDocument {
    /// Builds the in-memory schema, parsing every rule expression through a
    /// fresh snippet cache owned by the new instance.
    pub fn build(&self) -> SchemaResult<Schema> {
        let mut schema = Schema::new(&self.name);
        for entity in &self.entities {
            schema.add_entity(&entity.name)?;
        }
        for relation in &self.relations {
            match &relation.rule {
                Some(expression) => schema.add_computed_relation(
                    &relation.name,
                    &relation.subject,
                    &relation.object,
                    expression,
                )?,
                None => schema.add_relation(
                    &relation.name,
                    &relation.subject,
                    &relation.object,
                    &relation.cardinality,
                )?,
            }
        }
        for entity in &self.entities {
            for (action, policy) in &entity.permissions {
                let policy = match policy {
                    PolicyDoc::Allow => ActionPolicy::Allow,
                    PolicyDoc::Deny => ActionPolicy::Deny,
                    PolicyDoc::Guarded { rules } => {
                        let mut built = Vec::with_capacity(rules.len());
                        for expression in rules {
                            let rule = PermissionRule::new(expression, schema.cache_mut())?
                                .with_eid(Uuid::new_v4());
                            built.push(std::sync::Arc::new(rule));
                        }
                        ActionPolicy::Guarded(built)
                    }
                };
                schema.set_policy(&entity.name, *action, policy)?;
            }
        }
        Ok(schema)
    }
}

/// Loads schema documents from disk and maintains an in-memory registry.
pub struct SchemaLoader {
    schema_dir: PathBuf,
    schemas: HashMap<String, Schema>,
}

impl SchemaLoader {
    /// Creates a loader for the given data directory; schema files are
    /// expected at `<data_dir>/schemas/`.
    pub fn new(data_dir: &Path) -> Self {
        Self {
            schema_dir: data_dir.join("schemas"),
            schemas: HashMap::new(),
        }
    }

    pub fn schema_dir(&self) -> &Path {
        &self.schema_dir
    }

    /// Loads every schema file from the schema directory.
    pub fn load_all(&mut self) -> SchemaResult<()> {
        if !self.schema_dir.exists() {
            return Ok(());
        }
        let entries = fs::read_dir(&self.schema_dir).map_err(|e| SchemaError::MalformedSchema {
            path: self.schema_dir.display().to_string(),
            detail: format!("Failed to read schema directory: {}", e),
        })?;
        for entry in entries {
            let entry = entry.map_err(|e| SchemaError::MalformedSchema {
                path: self.schema_dir.display().to_string(),
                detail: format!("Failed to read directory entry: {}", e),
            })?;
            let path = entry.path();
            if path.extension().map_or(true, |ext| ext != "json") {
                continue;
            }
            self.load_schema_file(&path)?;
        }
        Ok(())
    }

    fn load_schema_file(&mut self, path: &Path) -> SchemaResult<()> {
        let content = fs::read_to_string(path).map_err(|e| SchemaError::MalformedSchema {
            path: path.display().to_string(),
            detail: format!("Failed to read file: {}", e),
        })?;
        let document: SchemaDocument =
            serde_json::from_str(&content).map_err(|e| SchemaError::MalformedSchema {
                path: path.display().to_string(),
                detail: format!("Invalid JSON: {}", e),
            })?;
        self.register(document)
    }

    /// Registers a schema document directly (for testing or programmatic
    /// creation). Re-registering a name fails: schemas are immutable.
    pub fn register(&mut self, document: SchemaDocument) -> SchemaResult<()> {
        if self.schemas.contains_key(&document.name) {
            return Err(SchemaError::SchemaImmutable(document.name));
        }
        let schema = document.build()?;
        self.schemas.insert(schema.name().to_string(), schema);
        Ok(())
    }

    /// Replaces a registered schema with a rebuilt one. The old instance's
    /// snippet cache is dropped with it.
    pub fn reload(&mut self, document: SchemaDocument) -> SchemaResult<()> {
        let schema = document.build()?;
        self.schemas.insert(schema.name().to_string(), schema);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Schema> {
        self.schemas.get(name)
    }

    pub fn exists(&self, name: &str) -> bool {
        self.schemas.contains_key(name)
    }

    pub fn schema_count(&self) -> usize {
        self.schemas.len()
    }

    /// Writes a schema document to its standard location.
    pub fn save_schema(&self, document: &SchemaDocument) -> SchemaResult<PathBuf> {
        let path = self.schema_dir.join(format!("{}.json", document.name));
        if path.exists() {
            return Err(SchemaError::SchemaImmutable(document.name.clone()));
        }
        if !self.schema_dir.exists() {
            fs::create_dir_all(&self.schema_dir).map_err(|e| SchemaError::MalformedSchema {
                path: self.schema_dir.display().to_string(),
                detail: format!("Failed to create schema directory: {}", e),
            })?;
        }
        let content =
            serde_json::to_string_pretty(document).map_err(|e| SchemaError::MalformedSchema {
                path: path.display().to_string(),
                detail: format!("Failed to serialize schema: {}", e),
            })?;
        fs::write(&path, content).map_err(|e| SchemaError::MalformedSchema {
            path: path.display().to_string(),
            detail: format!("Failed to write file: {}", e),
        })?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample_document() -> SchemaDocument {
        serde_json::from_value(serde_json::json!({
            "name": "blog",
            "entities": [
                {"name": "State"},
                {"name": "BlogEntry", "permissions": {
                    "read": {"type": "guarded",
                             "rules": ["X in_state S, S name \"published\""]},
                    "delete": {"type": "deny"}
                }}
            ],
            "relations": [
                {"name": "in_state", "subject": "BlogEntry", "object": "State",
                 "cardinality": "?*"},
                {"name": "name", "subject": "State", "object": "String",
                 "cardinality": "?*"}
            ]
        }))
        .unwrap()
    }

    #[test]
    fn test_register_and_get() {
        let tmp = TempDir::new().unwrap();
        let mut loader = SchemaLoader::new(tmp.path());
        loader.register(sample_document()).unwrap();

        let schema = loader.get("blog").unwrap();
        assert!(schema.has_entity("BlogEntry"));
        assert!(matches!(
            schema.policy("BlogEntry", Action::Delete),
            ActionPolicy::Deny
        ));
    }

    #[test]
    fn test_schema_immutability() {
        let tmp = TempDir::new().unwrap();
        let mut loader = SchemaLoader::new(tmp.path());
        loader.register(sample_document()).unwrap();

        let result = loader.register(sample_document());
        assert!(matches!(result, Err(SchemaError::SchemaImmutable(_))));
    }

    #[test]
    fn test_reload_replaces_schema() {
        let tmp = TempDir::new().unwrap();
        let mut loader = SchemaLoader::new(tmp.path());
        loader.register(sample_document()).unwrap();

        let mut updated = sample_document();
        updated.entities.push(EntityDoc {
            name: "Comment".into(),
            permissions: BTreeMap::new(),
        });
        loader.reload(updated).unwrap();
        assert!(loader.get("blog").unwrap().has_entity("Comment"));
    }

    #[test]
    fn test_save_and_load() {
        let tmp = TempDir::new().unwrap();
        let loader = SchemaLoader::new(tmp.path());
        loader.save_schema(&sample_document()).unwrap();

        let mut loader2 = SchemaLoader::new(tmp.path());
        loader2.load_all().unwrap();
        assert!(loader2.exists("blog"));
        assert_eq!(loader2.schema_count(), 1);
    }

    #[test]
    fn test_load_empty_directory() {
        let tmp = TempDir::new().unwrap();
        let mut loader = SchemaLoader::new(tmp.path());
        assert!(loader.load_all().is_ok());
        assert_eq!(loader.schema_count(), 0);
    }

    #[test]
    fn test_bad_rule_expression_fails_build() {
        let mut document = sample_document();
        document.entities[1]
            .permissions
            .insert(Action::Update, PolicyDoc::Guarded { rules: vec!["X owned_by".into()] });
        let tmp = TempDir::new().unwrap();
        let mut loader = SchemaLoader::new(tmp.path());
        assert!(matches!(
            loader.register(document),
            Err(SchemaError::InvalidExpression { .. })
        ));
    }
}
