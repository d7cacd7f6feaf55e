use crate::relationship::RelationshipRef;
use crate::types::ObjectType;
use crate::SchemaError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

static NO_MOUNTS: BTreeMap<String, Mount> = BTreeMap::new();
static NO_VARIABLES: BTreeMap<String, String> = BTreeMap::new();

fn default_app_dir() -> String {
    "/app".to_owned()
}

fn default_mount_source() -> String {
    "local".to_owned()
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Hooks {
    #[serde(default)]
    pub build: String,
    #[serde(default)]
    pub deploy: String,
    #[serde(default)]
    pub post_deploy: String,
}

/// A writable path inside an application container.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Mount {
    #[serde(default = "default_mount_source")]
    pub source: String,
    pub source_path: String,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct App {
    pub name: String,
    /// Runtime type and version, e.g. `php:8.2`.
    #[serde(rename = "type")]
    pub runtime: String,
    #[serde(default)]
    pub disk: Option<u32>,
    #[serde(default)]
    pub hooks: Hooks,
    #[serde(default)]
    pub start: Option<String>,
    #[serde(default = "default_app_dir")]
    pub working_dir: String,
    #[serde(default)]
    pub mounts: BTreeMap<String, Mount>,
    #[serde(default)]
    pub relationships: BTreeMap<String, String>,
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
}

/// A background process that runs the code of its parent application.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Worker {
    pub name: String,
    /// Name of the parent application.
    pub app: String,
    /// Inherited from the parent application when left empty.
    #[serde(rename = "type", default)]
    pub runtime: String,
    pub start: String,
    #[serde(default)]
    pub disk: Option<u32>,
    #[serde(default = "default_app_dir")]
    pub working_dir: String,
    #[serde(default)]
    pub mounts: BTreeMap<String, Mount>,
    #[serde(default)]
    pub relationships: BTreeMap<String, String>,
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Service {
    pub name: String,
    /// Service type and version, e.g. `mariadb:10.11`.
    #[serde(rename = "type")]
    pub service_type: String,
    #[serde(default)]
    pub disk: Option<u32>,
    #[serde(default)]
    pub configuration: serde_json::Value,
    #[serde(default)]
    pub relationships: BTreeMap<String, String>,
}

/// One deployable unit of a project.
#[derive(Debug, Clone, PartialEq)]
pub enum Definition {
    App(App),
    Worker(Worker),
    Service(Service),
}

impl Definition {
    pub fn name(&self) -> &str {
        match self {
            Definition::App(a) => &a.name,
            Definition::Worker(w) => &w.name,
            Definition::Service(s) => &s.name,
        }
    }

    pub fn object_type(&self) -> ObjectType {
        match self {
            Definition::App(_) => ObjectType::App,
            Definition::Worker(_) => ObjectType::Worker,
            Definition::Service(_) => ObjectType::Service,
        }
    }

    /// The `name:version` type string used to look up images and patches.
    pub fn type_name(&self) -> &str {
        match self {
            Definition::App(a) => &a.runtime,
            Definition::Worker(w) => &w.runtime,
            Definition::Service(s) => &s.service_type,
        }
    }

    /// Services run their image's own entrypoint.
    pub fn start_command(&self) -> Option<&str> {
        match self {
            Definition::App(a) => a.start.as_deref(),
            Definition::Worker(w) => Some(&w.start),
            Definition::Service(_) => None,
        }
    }

    pub fn working_dir(&self) -> &str {
        match self {
            Definition::App(a) => &a.working_dir,
            Definition::Worker(w) => &w.working_dir,
            Definition::Service(_) => "/",
        }
    }

    pub fn disk(&self) -> Option<u32> {
        match self {
            Definition::App(a) => a.disk,
            Definition::Worker(w) => w.disk,
            Definition::Service(s) => s.disk,
        }
    }

    pub fn mounts(&self) -> &BTreeMap<String, Mount> {
        match self {
            Definition::App(a) => &a.mounts,
            Definition::Worker(w) => &w.mounts,
            Definition::Service(_) => &NO_MOUNTS,
        }
    }

    pub fn variables(&self) -> &BTreeMap<String, String> {
        match self {
            Definition::App(a) => &a.variables,
            Definition::Worker(w) => &w.variables,
            Definition::Service(_) => &NO_VARIABLES,
        }
    }

    /// Build/deploy hooks. Only applications carry hooks.
    pub fn hooks(&self) -> Option<&Hooks> {
        match self {
            Definition::App(a) => Some(&a.hooks),
            Definition::Worker(_) | Definition::Service(_) => None,
        }
    }

    pub fn parent(&self) -> Option<&str> {
        match self {
            Definition::Worker(w) => Some(&w.app),
            Definition::App(_) | Definition::Service(_) => None,
        }
    }

    fn raw_relationships(&self) -> &BTreeMap<String, String> {
        match self {
            Definition::App(a) => &a.relationships,
            Definition::Worker(w) => &w.relationships,
            Definition::Service(s) => &s.relationships,
        }
    }

    /// Declared relationships as `(local name, reference)` pairs, in local-name order.
    pub fn relationships(&self) -> Result<Vec<(String, RelationshipRef)>, SchemaError> {
        self.raw_relationships()
            .iter()
            .map(|(local, spec)| Ok((local.clone(), RelationshipRef::parse(self.name(), spec)?)))
            .collect()
    }

    /// Names of the definitions that must be running before this one starts:
    /// the parent application of a worker first, then every referenced
    /// service, each listed once.
    pub fn dependencies(&self) -> Result<Vec<String>, SchemaError> {
        let mut deps: Vec<String> = Vec::new();
        if let Some(parent) = self.parent() {
            deps.push(parent.to_owned());
        }
        for (_, reference) in self.relationships()? {
            if !deps.contains(&reference.service) {
                deps.push(reference.service);
            }
        }
        Ok(deps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn app(name: &str, rels: &[(&str, &str)]) -> App {
        App {
            name: name.to_owned(),
            runtime: "php:8.2".to_owned(),
            disk: Some(512),
            hooks: Hooks::default(),
            start: None,
            working_dir: default_app_dir(),
            mounts: BTreeMap::new(),
            relationships: rels
                .iter()
                .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
                .collect(),
            variables: BTreeMap::new(),
        }
    }

    #[test]
    fn dependencies_are_unique_and_ordered() {
        let def = Definition::App(app(
            "main",
            &[("database", "db:default"), ("reports", "db:readonly"), ("cache", "redis:default")],
        ));
        assert_eq!(def.dependencies().unwrap(), vec!["redis", "db"]);
    }

    #[test]
    fn worker_depends_on_parent_first() {
        let def = Definition::Worker(Worker {
            name: "queue".to_owned(),
            app: "main".to_owned(),
            runtime: "php:8.2".to_owned(),
            start: "php worker.php".to_owned(),
            disk: None,
            working_dir: default_app_dir(),
            mounts: BTreeMap::new(),
            relationships: [("database".to_owned(), "db:default".to_owned())].into(),
            variables: BTreeMap::new(),
        });
        assert_eq!(def.dependencies().unwrap(), vec!["main", "db"]);
        assert_eq!(def.object_type(), ObjectType::Worker);
        assert_eq!(def.start_command(), Some("php worker.php"));
        assert!(def.hooks().is_none());
    }

    #[test]
    fn malformed_relationship_is_a_schema_error() {
        let def = Definition::App(app("main", &[("database", "db")]));
        assert!(matches!(
            def.dependencies(),
            Err(SchemaError::InvalidRelationship { .. })
        ));
    }

    #[test]
    fn services_have_no_mounts_or_hooks() {
        let def = Definition::Service(Service {
            name: "db".to_owned(),
            service_type: "mariadb:10.11".to_owned(),
            disk: Some(1024),
            configuration: serde_json::Value::Null,
            relationships: BTreeMap::new(),
        });
        assert!(def.mounts().is_empty());
        assert!(def.hooks().is_none());
        assert!(def.start_command().is_none());
        assert_eq!(def.working_dir(), "/");
        assert!(def.dependencies().unwrap().is_empty());
    }
}
