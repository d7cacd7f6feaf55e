//! Payloads exchanged with a container's open hook.
//!
//! The hook receives the endpoints its relationships resolved to as a single
//! base64 argument and answers with the endpoints it publishes, as a JSON
//! object on a line starting with [`ENDPOINTS_MARKER`]. Output from images
//! that predate the marker is accepted when its last non-empty line is the
//! JSON object.

use crate::CoreError;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use dockyard_runtime::config::{internal_hostname, sanitize};
use dockyard_runtime::contract::ENDPOINTS_MARKER;
use dockyard_schema::{Definition, RelationshipEndpoint};
use serde::Deserialize;
use std::collections::BTreeMap;

fn default_scheme() -> String {
    "tcp".to_owned()
}

/// One endpoint as published by the open hook, before host metadata is
/// attached.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct OpenEndpoint {
    pub port: u16,
    #[serde(default = "default_scheme")]
    pub scheme: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub query: Option<String>,
    #[serde(default)]
    pub public: bool,
    #[serde(default)]
    pub host_mapped: bool,
    #[serde(default, rename = "type")]
    pub service_type: Option<String>,
}

/// Encode resolved relationships as the open hook's argument.
pub fn encode_payload(
    relationships: &BTreeMap<String, Vec<RelationshipEndpoint>>,
) -> Result<String, CoreError> {
    Ok(STANDARD.encode(serde_json::to_vec(relationships)?))
}

/// Parse the endpoints published by `definition`'s open hook.
pub fn parse_output(
    definition: &str,
    output: &[u8],
) -> Result<BTreeMap<String, OpenEndpoint>, CoreError> {
    let invalid = |reason: String| CoreError::InvalidOpenPayload {
        definition: definition.to_owned(),
        reason,
    };

    let text = String::from_utf8_lossy(output);
    let marked = text
        .lines()
        .rev()
        .find_map(|line| line.trim_start().strip_prefix(ENDPOINTS_MARKER));
    let line = match marked {
        Some(rest) => rest.trim(),
        None => text
            .lines()
            .rev()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .ok_or_else(|| invalid("no output".to_owned()))?,
    };

    serde_json::from_str(line).map_err(|e| invalid(e.to_string()))
}

/// Attach the container's network identity to each published endpoint.
pub fn materialize(
    def: &Definition,
    ip: &str,
    published: BTreeMap<String, OpenEndpoint>,
) -> Vec<RelationshipEndpoint> {
    published
        .into_iter()
        .map(|(rel, ep)| RelationshipEndpoint {
            service: def.name().to_owned(),
            rel,
            host: internal_hostname(def.name()),
            hostname: sanitize(def.name()),
            ip: ip.to_owned(),
            port: ep.port,
            scheme: ep.scheme,
            username: ep.username,
            password: ep.password,
            path: ep.path,
            query: ep.query,
            public: ep.public,
            host_mapped: ep.host_mapped,
            service_type: ep.service_type.unwrap_or_else(|| def.type_name().to_owned()),
        })
        .collect()
}
