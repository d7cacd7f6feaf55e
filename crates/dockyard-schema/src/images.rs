//! Image registry: maps a definition's `name:version` type to an ordered list
//! of candidate container images.

use crate::SchemaError;

/// One runtime or service family and the image references that can run it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageEntry {
    pub name: String,
    /// Supported versions. Empty means any version is accepted.
    pub versions: Vec<String>,
    /// Candidate image references in preference order. `{version}` is
    /// replaced by the requested version.
    pub images: Vec<String>,
}

impl ImageEntry {
    pub fn new(name: &str, versions: &[&str], images: &[&str]) -> Self {
        Self {
            name: name.to_owned(),
            versions: versions.iter().map(|v| (*v).to_owned()).collect(),
            images: images.iter().map(|i| (*i).to_owned()).collect(),
        }
    }
}

/// Immutable lookup table of [`ImageEntry`] values.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImageRegistry {
    entries: Vec<ImageEntry>,
}

impl ImageRegistry {
    pub fn new(entries: Vec<ImageEntry>) -> Self {
        Self { entries }
    }

    pub fn entries(&self) -> &[ImageEntry] {
        &self.entries
    }

    /// Candidate images for `type_name` (`name:version`), first match wins.
    pub fn candidates(&self, type_name: &str) -> Result<Vec<String>, SchemaError> {
        let (name, version) = type_name.split_once(':').unwrap_or((type_name, ""));
        let entry = self
            .entries
            .iter()
            .find(|e| e.name == name)
            .ok_or_else(|| SchemaError::UnknownType(type_name.to_owned()))?;

        let version = if version.is_empty() {
            entry.versions.last().map_or("latest", String::as_str)
        } else {
            version
        };
        if !entry.versions.is_empty() && !entry.versions.iter().any(|v| v == version) {
            return Err(SchemaError::UnsupportedVersion {
                name: name.to_owned(),
                version: version.to_owned(),
            });
        }

        Ok(entry
            .images
            .iter()
            .map(|template| template.replace("{version}", version))
            .collect())
    }

    /// The table shipped with Dockyard.
    pub fn builtin() -> Self {
        Self::new(vec![
            ImageEntry::new(
                "php",
                &["7.4", "8.0", "8.1", "8.2", "8.3"],
                &[
                    "ghcr.io/dockyard-images/php-{version}:latest",
                    "docker.io/library/php:{version}-fpm",
                ],
            ),
            ImageEntry::new(
                "python",
                &["3.9", "3.10", "3.11", "3.12"],
                &[
                    "ghcr.io/dockyard-images/python-{version}:latest",
                    "docker.io/library/python:{version}",
                ],
            ),
            ImageEntry::new(
                "nodejs",
                &["18", "20", "22"],
                &[
                    "ghcr.io/dockyard-images/nodejs-{version}:latest",
                    "docker.io/library/node:{version}",
                ],
            ),
            ImageEntry::new(
                "golang",
                &["1.21", "1.22", "1.23"],
                &[
                    "ghcr.io/dockyard-images/golang-{version}:latest",
                    "docker.io/library/golang:{version}",
                ],
            ),
            ImageEntry::new(
                "ruby",
                &["3.1", "3.2", "3.3"],
                &[
                    "ghcr.io/dockyard-images/ruby-{version}:latest",
                    "docker.io/library/ruby:{version}",
                ],
            ),
            ImageEntry::new(
                "mariadb",
                &["10.4", "10.6", "10.11", "11.4"],
                &[
                    "ghcr.io/dockyard-images/mariadb-{version}:latest",
                    "docker.io/library/mariadb:{version}",
                ],
            ),
            ImageEntry::new(
                "mysql",
                &["10.4", "10.6", "10.11", "11.4"],
                &[
                    "ghcr.io/dockyard-images/mariadb-{version}:latest",
                    "docker.io/library/mariadb:{version}",
                ],
            ),
            ImageEntry::new(
                "postgresql",
                &["13", "14", "15", "16"],
                &[
                    "ghcr.io/dockyard-images/postgresql-{version}:latest",
                    "docker.io/library/postgres:{version}",
                ],
            ),
            ImageEntry::new(
                "redis",
                &["6.2", "7.0", "7.2"],
                &[
                    "ghcr.io/dockyard-images/redis-{version}:latest",
                    "docker.io/library/redis:{version}",
                ],
            ),
            ImageEntry::new(
                "redis-persistent",
                &["6.2", "7.0", "7.2"],
                &[
                    "ghcr.io/dockyard-images/redis-{version}:latest",
                    "docker.io/library/redis:{version}",
                ],
            ),
            ImageEntry::new(
                "memcached",
                &["1.6"],
                &["docker.io/library/memcached:{version}"],
            ),
            ImageEntry::new(
                "opensearch",
                &["2"],
                &["docker.io/opensearchproject/opensearch:{version}"],
            ),
            ImageEntry::new(
                "solr",
                &["8.11", "9.6"],
                &["docker.io/library/solr:{version}"],
            ),
            ImageEntry::new(
                "rabbitmq",
                &["3.12", "3.13"],
                &["docker.io/library/rabbitmq:{version}-management"],
            ),
            ImageEntry::new(
                "varnish",
                &["7.4"],
                &["docker.io/library/varnish:{version}"],
            ),
            ImageEntry::new(
                "router",
                &[],
                &["docker.io/library/nginx:stable-alpine"],
            ),
        ])
    }
}
