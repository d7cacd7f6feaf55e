use crate::SchemaError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A declared dependency on one endpoint of another definition,
/// written as `"<service>:<endpoint>"`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RelationshipRef {
    pub service: String,
    pub endpoint: String,
}

impl RelationshipRef {
    pub fn parse(definition: &str, spec: &str) -> Result<Self, SchemaError> {
        let invalid = || SchemaError::InvalidRelationship {
            definition: definition.to_owned(),
            spec: spec.to_owned(),
        };
        let (service, endpoint) = spec.split_once(':').ok_or_else(invalid)?;
        let (service, endpoint) = (service.trim(), endpoint.trim());
        if service.is_empty() || endpoint.is_empty() || endpoint.contains(':') {
            return Err(invalid());
        }
        Ok(Self {
            service: service.to_owned(),
            endpoint: endpoint.to_owned(),
        })
    }
}

impl fmt::Display for RelationshipRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.service, self.endpoint)
    }
}

/// One resolved connection endpoint published by a container's open step.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RelationshipEndpoint {
    /// Name of the definition that owns the endpoint.
    pub service: String,
    /// Endpoint key, the right-hand side of `service:endpoint`.
    pub rel: String,
    pub host: String,
    pub hostname: String,
    pub ip: String,
    pub port: u16,
    pub scheme: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    #[serde(default)]
    pub public: bool,
    #[serde(default)]
    pub host_mapped: bool,
    #[serde(default, rename = "type")]
    pub service_type: String,
}

impl RelationshipEndpoint {
    pub fn matches(&self, reference: &RelationshipRef) -> bool {
        self.service == reference.service && self.rel == reference.endpoint
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_service_and_endpoint() {
        let r = RelationshipRef::parse("app", "db:mysql").unwrap();
        assert_eq!(r.service, "db");
        assert_eq!(r.endpoint, "mysql");
        assert_eq!(r.to_string(), "db:mysql");
    }

    #[test]
    fn parse_rejects_malformed_specs() {
        for spec in ["db", ":mysql", "db:", "db:a:b", ""] {
            assert!(
                RelationshipRef::parse("app", spec).is_err(),
                "'{spec}' should be rejected"
            );
        }
    }

    #[test]
    fn endpoint_matches_exact_pair_only() {
        let ep = RelationshipEndpoint {
            service: "db".to_owned(),
            rel: "default".to_owned(),
            host: "db.internal".to_owned(),
            hostname: "db".to_owned(),
            ip: "172.18.0.2".to_owned(),
            port: 3306,
            scheme: "mysql".to_owned(),
            username: None,
            password: None,
            path: None,
            query: None,
            public: false,
            host_mapped: false,
            service_type: "mariadb:10.11".to_owned(),
        };
        assert!(ep.matches(&RelationshipRef::parse("x", "db:default").unwrap()));
        assert!(!ep.matches(&RelationshipRef::parse("x", "db:admin").unwrap()));
        assert!(!ep.matches(&RelationshipRef::parse("x", "cache:default").unwrap()));
    }
}
