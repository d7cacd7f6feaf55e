//! Patch table: shell fragments run as root in freshly started containers to
//! work around known defects of specific images.

/// A type pattern and the script applied to matching definitions.
///
/// Patterns are either an exact `name:version` or end in `*`, in which case
/// they match any type string starting with the text before the `*`
/// (`mariadb:*`, `php:7.*`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchEntry {
    pub pattern: String,
    pub script: String,
}

impl PatchEntry {
    pub fn new(pattern: &str, script: &str) -> Self {
        Self {
            pattern: pattern.to_owned(),
            script: script.to_owned(),
        }
    }

    pub fn matches(&self, type_name: &str) -> bool {
        match self.pattern.strip_suffix('*') {
            Some(prefix) => type_name.starts_with(prefix),
            None => self.pattern == type_name,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PatchTable {
    entries: Vec<PatchEntry>,
}

impl PatchTable {
    pub fn new(entries: Vec<PatchEntry>) -> Self {
        Self { entries }
    }

    /// First entry matching `type_name`, in table order.
    pub fn lookup(&self, type_name: &str) -> Option<&PatchEntry> {
        self.entries.iter().find(|e| e.matches(type_name))
    }

    pub fn builtin() -> Self {
        Self::new(vec![
            PatchEntry::new(
                "mariadb:*",
                "mkdir -p /run/mysqld && chown -R mysql:mysql /run/mysqld",
            ),
            PatchEntry::new(
                "mysql:*",
                "mkdir -p /run/mysqld && chown -R mysql:mysql /run/mysqld",
            ),
            PatchEntry::new(
                "php:7.*",
                "sed -i 's/^;\\?clear_env.*/clear_env = no/' /etc/php/*/fpm/pool.d/www.conf || true",
            ),
            PatchEntry::new(
                "postgresql:*",
                "mkdir -p /run/postgresql && chown postgres:postgres /run/postgresql",
            ),
            PatchEntry::new("solr:8.11", "rm -f /var/solr/data/*/data/index/write.lock"),
        ])
    }
}
