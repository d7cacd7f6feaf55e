//! Realizing declared application mounts.
//!
//! Each strategy contributes two things: what the container needs at
//! creation time (an extra volume, privileges) and a root script run once the
//! container is up that makes every mount target a writable directory.

use crate::layout::{ProjectLayout, DOCKYARD_DIR};
use crate::CoreError;
use dockyard_runtime::config::volume_key;
use dockyard_runtime::contract::{MOUNTS_VOLUME_TARGET, PROJECT_MOUNT};
use dockyard_runtime::VolumeMount;
use dockyard_schema::{Definition, MountStrategy, Slot};
use std::path::{Component, Path};

/// Keep only the normal components of a relative path.
fn clean_relative(path: &str) -> String {
    Path::new(path)
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => part.to_str(),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// Absolute in-container path of a mount destination. Relative destinations
/// are resolved against the definition's working directory.
pub fn mount_target(def: &Definition, destination: &str) -> String {
    if destination.starts_with('/') {
        return destination.trim_end_matches('/').to_owned();
    }
    format!(
        "{}/{}",
        def.working_dir().trim_end_matches('/'),
        clean_relative(destination)
    )
}

/// Shadow directory a symlinked mount points at, relative to the project root.
fn shadow_relative(def: &Definition, source_path: &str) -> String {
    format!(
        "{DOCKYARD_DIR}/mounts/{}/{}",
        def.name(),
        clean_relative(source_path)
    )
}

/// The volume backing mounts under the volume strategy.
pub fn mounts_volume(
    def: &Definition,
    project: &str,
    slot: Slot,
    strategy: MountStrategy,
) -> Option<VolumeMount> {
    (strategy == MountStrategy::Volume && !def.mounts().is_empty()).then(|| {
        VolumeMount::slotted(
            project,
            volume_key(def.object_type(), def.name(), "mounts"),
            slot,
            MOUNTS_VOLUME_TARGET,
        )
    })
}

/// Create the host side of symlinked mounts so the container sees them
/// through the project bind mount.
pub fn prepare_host(
    layout: &ProjectLayout,
    def: &Definition,
    strategy: MountStrategy,
) -> Result<(), CoreError> {
    if strategy != MountStrategy::Symlink {
        return Ok(());
    }
    for mount in def.mounts().values() {
        std::fs::create_dir_all(layout.root().join(shadow_relative(def, &mount.source_path)))?;
    }
    Ok(())
}

/// Quote `word` for `sh`. Words made only of path-safe characters are left
/// as they are.
pub(crate) fn shell_quote(word: &str) -> String {
    let plain = !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "/._-+:@=,%".contains(c));
    if plain {
        word.to_owned()
    } else {
        format!("'{}'", word.replace('\'', r"'\''"))
    }
}

/// Root script realizing every mount of `def`, or `None` when it declares no
/// mounts.
pub fn mount_script(def: &Definition, strategy: MountStrategy) -> Option<String> {
    if def.mounts().is_empty() {
        return None;
    }
    let mut lines = Vec::new();
    for (destination, mount) in def.mounts() {
        let target = shell_quote(&mount_target(def, destination));
        match strategy {
            MountStrategy::None => {
                lines.push(format!("mkdir -p {target}"));
            }
            MountStrategy::Symlink => {
                let shadow = shell_quote(&format!(
                    "{PROJECT_MOUNT}/{}",
                    shadow_relative(def, &mount.source_path)
                ));
                lines.push(format!("mkdir -p {shadow}"));
                lines.push(format!("rm -rf {target}"));
                lines.push(format!("ln -sfn {shadow} {target}"));
            }
            MountStrategy::Volume => {
                let source = shell_quote(&format!(
                    "{MOUNTS_VOLUME_TARGET}/{}",
                    clean_relative(&mount.source_path)
                ));
                lines.push(format!("mkdir -p {source} {target}"));
                lines.push(format!("mount --bind {source} {target}"));
            }
        }
    }
    Some(lines.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use dockyard_schema::{App, Hooks, Mount, Service};
    use std::collections::BTreeMap;

    fn app() -> Definition {
        Definition::App(App {
            name: "main".to_owned(),
            runtime: "php:8.2".to_owned(),
            disk: None,
            hooks: Hooks::default(),
            start: None,
            working_dir: "/app/".to_owned(),
            mounts: BTreeMap::from([
                (
                    "web/uploads".to_owned(),
                    Mount {
                        source: "local".to_owned(),
                        source_path: "uploads".to_owned(),
                    },
                ),
                (
                    "/var/cache/app".to_owned(),
                    Mount {
                        source: "local".to_owned(),
                        source_path: "../cache".to_owned(),
                    },
                ),
            ]),
            relationships: BTreeMap::new(),
            variables: BTreeMap::new(),
        })
    }

    #[test]
    fn targets_resolve_against_working_dir() {
        let def = app();
        assert_eq!(mount_target(&def, "web/uploads"), "/app/web/uploads");
        assert_eq!(mount_target(&def, "/var/cache/app/"), "/var/cache/app");
    }

    #[test]
    fn none_strategy_creates_directories() {
        let script = mount_script(&app(), MountStrategy::None).unwrap();
        assert!(script.contains("mkdir -p /app/web/uploads"));
        assert!(!script.contains("ln "));
    }

    #[test]
    fn symlink_strategy_points_into_project_tree() {
        let script = mount_script(&app(), MountStrategy::Symlink).unwrap();
        assert!(script.contains(
            "ln -sfn /mnt/project/.dockyard/mounts/main/uploads /app/web/uploads"
        ));
        assert!(script.contains("/mnt/project/.dockyard/mounts/main/cache"));
        assert!(!script.contains(".."));
    }

    #[test]
    fn volume_strategy_binds_from_volume() {
        let script = mount_script(&app(), MountStrategy::Volume).unwrap();
        assert!(script.contains("mount --bind /mnt/mounts/uploads /app/web/uploads"));

        let vol = mounts_volume(&app(), "shop", Slot::PRIMARY, MountStrategy::Volume).unwrap();
        assert_eq!(vol.key, "app-main-mounts");
        assert!(vol.name.starts_with("dockyard-shop-app-main-mounts-1-"));
        assert!(mounts_volume(&app(), "shop", Slot::PRIMARY, MountStrategy::Symlink).is_none());
    }

    #[test]
    fn paths_with_spaces_stay_one_word() {
        let mut def = app();
        if let Definition::App(app) = &mut def {
            app.mounts.insert(
                "web/my uploads".to_owned(),
                Mount {
                    source: "local".to_owned(),
                    source_path: "it's files".to_owned(),
                },
            );
        }
        let script = mount_script(&def, MountStrategy::Symlink).unwrap();
        assert!(script.contains("rm -rf '/app/web/my uploads'"));
        assert!(script.contains(
            r"ln -sfn '/mnt/project/.dockyard/mounts/main/it'\''s files' '/app/web/my uploads'"
        ));
        assert!(!script.contains("rm -rf /app/web/my "));

        let script = mount_script(&def, MountStrategy::Volume).unwrap();
        assert!(script.contains(r"mount --bind '/mnt/mounts/it'\''s files' '/app/web/my uploads'"));
    }

    #[test]
    fn shell_quote_leaves_plain_paths_alone() {
        assert_eq!(shell_quote("/app/web/uploads"), "/app/web/uploads");
        assert_eq!(shell_quote("a b"), "'a b'");
        assert_eq!(shell_quote("a;rm -rf /"), "'a;rm -rf /'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote(""), "''");
    }

    #[test]
    fn definitions_without_mounts_need_nothing() {
        let svc = Definition::Service(Service {
            name: "db".to_owned(),
            service_type: "mariadb:10.11".to_owned(),
            disk: None,
            configuration: serde_json::Value::Null,
            relationships: BTreeMap::new(),
        });
        assert!(mount_script(&svc, MountStrategy::Volume).is_none());
        assert!(mounts_volume(&svc, "shop", Slot::PRIMARY, MountStrategy::Volume).is_none());
    }

    #[test]
    fn prepare_host_creates_shadow_tree() {
        let dir = tempfile::tempdir().unwrap();
        let layout = ProjectLayout::new(dir.path());
        prepare_host(&layout, &app(), MountStrategy::Symlink).unwrap();
        assert!(layout.shadow_dir("main").join("uploads").is_dir());
        assert!(layout.shadow_dir("main").join("cache").is_dir());
    }
}
