use dockyard_core::{
    resolve_order, CoreError, LifecycleStage, Orchestrator, Project, StartOptions, UnresolvedKind,
};
use dockyard_runtime::config::{volume_key, volume_name};
use dockyard_runtime::contract::{BUILT_SENTINEL, CONFIG_PATH, OPEN_COMMAND};
use dockyard_runtime::mock::{MockBackend, MockReply};
use dockyard_runtime::{Confirmation, NoProgress, RuntimeError};
use dockyard_schema::{parse_project_str, Definition, ObjectType, Service, Slot};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::time::Duration;

const SHOP: &str = r#"
[project]
id = "shop"

[[service]]
name = "db"
type = "mariadb:10.11"

[[app]]
name = "main"
type = "php:8.2"
hooks = { build = "composer install" }
relationships = { database = "db:default" }

[[worker]]
name = "queue"
app = "main"
start = "php artisan queue:work"
relationships = { database = "db:default" }
"#;

fn project(dir: &Path, source: &str) -> Project {
    Project::from_file(dir, parse_project_str(source).unwrap()).unwrap()
}

fn orchestrator(backend: MockBackend) -> Orchestrator {
    Orchestrator::new(Box::new(backend)).with_readiness_poll(Duration::from_millis(1))
}

fn start(orch: &Orchestrator, project: &Project) -> dockyard_core::StartReport {
    orch.start(project, StartOptions::default(), &NoProgress)
        .unwrap()
}

fn download(orch: &Orchestrator, id: &str, path: &str) -> Result<Vec<u8>, RuntimeError> {
    let mut out = Vec::new();
    orch.runtime().container_download(id, path, &mut out)?;
    Ok(out)
}

fn document(orch: &Orchestrator, project: &Project, name: &str) -> serde_json::Value {
    let id = orch.container_id(project, name).unwrap();
    serde_json::from_slice(&download(orch, &id, CONFIG_PATH).unwrap()).unwrap()
}

fn slot_volumes(orch: &Orchestrator, project: &Project, slot: u32) -> Vec<String> {
    orch.volumes(project)
        .unwrap()
        .into_iter()
        .filter(|v| v.slot.map(Slot::get) == Some(slot))
        .map(|v| v.name)
        .collect()
}

fn service(name: &str, deps: &[String]) -> Definition {
    Definition::Service(Service {
        name: name.to_owned(),
        service_type: "redis:7.2".to_owned(),
        disk: None,
        configuration: serde_json::Value::Null,
        relationships: deps
            .iter()
            .enumerate()
            .map(|(i, d)| (format!("r{i}"), format!("{d}:default")))
            .collect(),
    })
}

/// Small deterministic generator so graph shapes are reproducible.
struct Lcg(u64);

impl Lcg {
    fn below(&mut self, bound: usize) -> usize {
        self.0 = self
            .0
            .wrapping_mul(6_364_136_223_846_793_005)
            .wrapping_add(1_442_695_040_888_963_407);
        ((self.0 >> 33) as usize) % bound.max(1)
    }
}

#[test]
fn resolver_respects_every_edge_of_acyclic_graphs() {
    let mut rng = Lcg(7);
    for _ in 0..200 {
        let n = 1 + rng.below(12);
        // Node i may only depend on nodes with a smaller index, so the graph
        // is acyclic; the input order is then shuffled.
        let mut defs: Vec<Definition> = (0..n)
            .map(|i| {
                let deps: Vec<String> = (0..i)
                    .filter(|_| rng.below(3) == 0)
                    .map(|j| format!("n{j}"))
                    .collect();
                service(&format!("n{i}"), &deps)
            })
            .collect();
        for i in (1..defs.len()).rev() {
            let j = rng.below(i + 1);
            defs.swap(i, j);
        }

        let order = resolve_order(&defs).unwrap();
        assert_eq!(order.len(), defs.len());
        let pos: HashMap<&str, usize> = order
            .iter()
            .enumerate()
            .map(|(i, d)| (d.name(), i))
            .collect();
        for def in &defs {
            for dep in def.dependencies().unwrap() {
                assert!(pos[dep.as_str()] < pos[def.name()]);
            }
        }
    }
}

#[test]
fn resolver_is_deterministic() {
    let defs: Vec<Definition> = ["e", "d", "c", "b", "a"]
        .iter()
        .map(|n| service(n, &[]))
        .collect();
    let first: Vec<&str> = resolve_order(&defs).unwrap().iter().map(|d| d.name()).collect();
    let second: Vec<&str> = resolve_order(&defs).unwrap().iter().map(|d| d.name()).collect();
    assert_eq!(first, vec!["e", "d", "c", "b", "a"]);
    assert_eq!(first, second);
}

#[test]
fn cyclic_project_is_rejected_before_anything_starts() {
    let dir = tempfile::tempdir().unwrap();
    let project = project(
        dir.path(),
        r#"
[project]
id = "loop"

[[service]]
name = "root"
type = "redis:7.2"

[[service]]
name = "a"
type = "redis:7.2"
relationships = { next = "b:default" }

[[service]]
name = "b"
type = "redis:7.2"
relationships = { next = "c:default" }

[[service]]
name = "c"
type = "redis:7.2"
relationships = { back = "a:default", base = "root:default" }
"#,
    );
    let orch = orchestrator(MockBackend::new());

    match orch.start(&project, StartOptions::default(), &NoProgress) {
        Err(CoreError::UnresolvedRelationship { kind, names }) => {
            assert_eq!(kind, UnresolvedKind::Cyclic);
            assert_eq!(names, vec!["a", "b", "c"]);
        }
        other => panic!("expected cyclic error, got {other:?}"),
    }
    assert!(orch.all_status().unwrap().is_empty());
}

#[test]
fn end_to_end_db_app_worker() {
    let dir = tempfile::tempdir().unwrap();
    let project = project(dir.path(), SHOP);
    let orch = orchestrator(MockBackend::new());

    let report = start(&orch, &project);
    let pos = |name: &str| report.order.iter().position(|n| n == name).unwrap();
    assert!(pos("db") < pos("main"));
    assert!(pos("db") < pos("queue"));
    assert!(pos("main") < pos("queue"));

    let db_default: Vec<_> = report
        .registry
        .endpoints()
        .iter()
        .filter(|e| e.service == "db" && e.rel == "default")
        .collect();
    assert_eq!(db_default.len(), 1);
    assert_eq!(db_default[0].host, "db.internal");

    let app_rels = &document(&orch, &project, "main")["relationships"]["database"];
    let worker_rels = &document(&orch, &project, "queue")["relationships"]["database"];
    assert_eq!(app_rels, worker_rels);
    assert_eq!(app_rels.as_array().unwrap().len(), 1);
    assert_eq!(app_rels[0]["port"], 3306);

    let queue = report.trace("queue").unwrap();
    assert!(queue.stages.contains(&LifecycleStage::BuildSkipped));
    assert_eq!(queue.stages.last(), Some(&LifecycleStage::Opened));
    let main = report.trace("main").unwrap();
    assert_eq!(main.stages.last(), Some(&LifecycleStage::PostDeployed));
}

#[test]
fn worker_starts_from_parent_build() {
    let dir = tempfile::tempdir().unwrap();
    let project = project(dir.path(), SHOP);
    let orch = orchestrator(MockBackend::new());
    start(&orch, &project);

    let worker = orch.container_id(&project, "queue").unwrap();
    let app = orch.container_id(&project, "main").unwrap();
    assert_eq!(
        download(&orch, &worker, BUILT_SENTINEL).unwrap(),
        download(&orch, &app, BUILT_SENTINEL).unwrap()
    );
}

#[test]
fn build_is_skipped_when_current_unless_forced() {
    let dir = tempfile::tempdir().unwrap();
    let project = project(dir.path(), SHOP);
    let orch = orchestrator(MockBackend::new());

    let first = start(&orch, &project);
    assert!(first
        .trace("main")
        .unwrap()
        .stages
        .contains(&LifecycleStage::Built));

    orch.stop(&project).unwrap();
    let second = start(&orch, &project);
    let stages = &second.trace("main").unwrap().stages;
    assert!(stages.contains(&LifecycleStage::BuildSkipped));
    assert!(!stages.contains(&LifecycleStage::Built));

    orch.stop(&project).unwrap();
    let forced = orch
        .start(
            &project,
            StartOptions {
                force_build: true,
                no_commit: true,
            },
            &NoProgress,
        )
        .unwrap();
    let stages = &forced.trace("main").unwrap().stages;
    assert!(stages.contains(&LifecycleStage::Built));
    assert!(stages.contains(&LifecycleStage::CommitSkipped));
}

#[test]
fn disabled_commit_keeps_no_image() {
    let dir = tempfile::tempdir().unwrap();
    let source = SHOP.replace("id = \"shop\"", "id = \"shop\"\n\n[options]\ndisable_commit = true");
    let project = project(dir.path(), &source);
    let orch = orchestrator(MockBackend::new());

    let report = start(&orch, &project);
    assert!(report
        .trace("main")
        .unwrap()
        .stages
        .contains(&LifecycleStage::CommitSkipped));
    assert!(orch.status(&project).unwrap().iter().all(|s| !s.status.has_commit));
}

#[test]
fn already_running_start_republishes_endpoints() {
    let dir = tempfile::tempdir().unwrap();
    let project = project(dir.path(), SHOP);
    let orch = orchestrator(MockBackend::new());

    let first = start(&orch, &project);
    let second = start(&orch, &project);
    assert!(second.traces.iter().all(|t| t.already_running));
    assert_eq!(first.registry, second.registry);
}

#[test]
fn failing_definition_aborts_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let project = project(dir.path(), SHOP);
    let backend = MockBackend::new();
    backend.on_command(OPEN_COMMAND, |call| {
        if call.config.object_name == "db" {
            MockReply::exit(3)
        } else {
            MockReply::ok("@@dockyard:endpoints@@ {}\n")
        }
    });
    let orch = orchestrator(backend);

    let err = orch
        .start(&project, StartOptions::default(), &NoProgress)
        .unwrap_err();
    match &err {
        CoreError::Stage {
            definition, stage, ..
        } => {
            assert_eq!(definition, "db");
            assert_eq!(*stage, LifecycleStage::Opened);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(err.runtime().and_then(RuntimeError::exit_code), Some(3));

    let main = orch.container_id(&project, "main").unwrap();
    assert!(!orch.runtime().container_status(&main).unwrap().exists());
}

#[test]
fn missing_image_fails_before_any_start() {
    let dir = tempfile::tempdir().unwrap();
    let project = project(dir.path(), SHOP);
    let orch = orchestrator(MockBackend::with_registry(["docker.io/library/php:8.2-fpm"]));

    let err = orch
        .start(&project, StartOptions::default(), &NoProgress)
        .unwrap_err();
    assert!(matches!(err.runtime(), Some(RuntimeError::ImageNotFound(_))));
    assert!(orch.all_status().unwrap().is_empty());
}

#[test]
fn unknown_relationship_target_is_missing() {
    let dir = tempfile::tempdir().unwrap();
    let project = project(
        dir.path(),
        r#"
[project]
id = "shop"

[[app]]
name = "main"
type = "php:8.2"
relationships = { search = "opensearch:default" }
"#,
    );
    let orch = orchestrator(MockBackend::new());
    assert!(matches!(
        orch.start(&project, StartOptions::default(), &NoProgress),
        Err(CoreError::UnresolvedRelationship {
            kind: UnresolvedKind::Missing,
            ..
        })
    ));
}

#[test]
fn primary_slot_purge_requires_confirmation() {
    let dir = tempfile::tempdir().unwrap();
    let project = project(dir.path(), SHOP);
    let orch = orchestrator(MockBackend::new());
    start(&orch, &project);

    let err = orch
        .purge_slot(&project, Slot::PRIMARY, Confirmation::Unconfirmed)
        .unwrap_err();
    assert!(matches!(
        err.runtime(),
        Some(RuntimeError::InvalidSlot { slot: 1, .. })
    ));
    assert!(!slot_volumes(&orch, &project, 1).is_empty());
}

#[test]
fn purge_slot_only_touches_that_slot() {
    let dir = tempfile::tempdir().unwrap();
    let project = project(dir.path(), SHOP);
    let orch = orchestrator(MockBackend::new());
    start(&orch, &project);
    orch.set_slot(&project, Slot::new(2).unwrap()).unwrap();
    start(&orch, &project);

    let slot_one = slot_volumes(&orch, &project, 1);
    assert!(!slot_volumes(&orch, &project, 2).is_empty());

    orch.purge_slot(&project, Slot::new(2).unwrap(), Confirmation::Unconfirmed)
        .unwrap();
    assert!(slot_volumes(&orch, &project, 2).is_empty());
    assert_eq!(slot_volumes(&orch, &project, 1), slot_one);
    let global = orch
        .runtime()
        .volume_list()
        .unwrap()
        .into_iter()
        .filter(|v| v.global)
        .count();
    assert_eq!(global, 1);
}

#[test]
fn dashed_project_ids_keep_their_own_volumes() {
    let shop_dir = tempfile::tempdir().unwrap();
    let cache_dir = tempfile::tempdir().unwrap();
    let shop = project(
        shop_dir.path(),
        "[project]\nid = \"shop\"\n\n[[service]]\nname = \"cache-db\"\ntype = \"redis:7.2\"\n",
    );
    let shop_cache = project(
        cache_dir.path(),
        "[project]\nid = \"shop-cache\"\n\n[[service]]\nname = \"db\"\ntype = \"redis:7.2\"\n",
    );
    let orch = orchestrator(MockBackend::new());
    start(&orch, &shop);
    start(&orch, &shop_cache);

    let mine = slot_volumes(&orch, &shop, 1);
    let theirs = slot_volumes(&orch, &shop_cache, 1);
    assert_eq!(mine.len(), 1);
    assert_eq!(theirs.len(), 1);
    assert_ne!(mine, theirs);
    assert_ne!(
        orch.container_id(&shop, "cache-db").unwrap(),
        orch.container_id(&shop_cache, "db").unwrap()
    );

    orch.purge(&shop).unwrap();
    assert!(slot_volumes(&orch, &shop, 1).is_empty());
    assert_eq!(slot_volumes(&orch, &shop_cache, 1), theirs);
    assert!(orch.status(&shop_cache).unwrap()[0].status.running);
}

#[test]
fn copied_slot_survives_source_purge() {
    let dir = tempfile::tempdir().unwrap();
    let project = project(dir.path(), SHOP);
    let orch = orchestrator(MockBackend::new());
    start(&orch, &project);

    let three = Slot::new(3).unwrap();
    orch.copy_slot(&project, Slot::PRIMARY, three, Confirmation::Unconfirmed)
        .unwrap();
    let copied = slot_volumes(&orch, &project, 3);
    assert_eq!(copied.len(), slot_volumes(&orch, &project, 1).len());
    let db_three = volume_name("shop", &volume_key(ObjectType::Service, "db", "data"), three);
    assert!(copied.contains(&db_three));

    orch.purge_slot(&project, Slot::PRIMARY, Confirmation::Operator)
        .unwrap();
    assert!(slot_volumes(&orch, &project, 1).is_empty());
    assert_eq!(slot_volumes(&orch, &project, 3), copied);
}

#[test]
fn copy_over_primary_needs_confirmation() {
    let dir = tempfile::tempdir().unwrap();
    let project = project(dir.path(), SHOP);
    let orch = orchestrator(MockBackend::new());
    start(&orch, &project);
    let two = Slot::new(2).unwrap();
    orch.copy_slot(&project, Slot::PRIMARY, two, Confirmation::Unconfirmed)
        .unwrap();

    assert!(orch
        .copy_slot(&project, two, Slot::PRIMARY, Confirmation::Unconfirmed)
        .is_err());
    assert!(orch
        .copy_slot(&project, two, two, Confirmation::Operator)
        .is_err());
    orch.copy_slot(&project, two, Slot::PRIMARY, Confirmation::Operator)
        .unwrap();
}

#[test]
fn all_purge_keeps_only_the_global_volume() {
    let dir = tempfile::tempdir().unwrap();
    let shop = project(dir.path(), SHOP);
    let other_dir = tempfile::tempdir().unwrap();
    let blog = project(
        other_dir.path(),
        &SHOP.replace("id = \"shop\"", "id = \"blog\""),
    );
    let orch = orchestrator(MockBackend::new());
    start(&orch, &shop);
    start(&orch, &blog);
    assert!(orch.runtime().volume_list().unwrap().len() > 1);

    orch.all_purge(false).unwrap();
    let left = orch.runtime().volume_list().unwrap();
    assert_eq!(left.len(), 1);
    assert!(left[0].global);
    assert!(orch.all_status().unwrap().is_empty());

    orch.all_purge(true).unwrap();
    assert!(orch.runtime().volume_list().unwrap().is_empty());
}

#[test]
fn project_purge_keeps_global_and_other_projects() {
    let dir = tempfile::tempdir().unwrap();
    let shop = project(dir.path(), SHOP);
    let other_dir = tempfile::tempdir().unwrap();
    let blog = project(
        other_dir.path(),
        &SHOP.replace("id = \"shop\"", "id = \"blog\""),
    );
    let orch = orchestrator(MockBackend::new());
    start(&orch, &shop);
    start(&orch, &blog);

    orch.purge(&shop).unwrap();
    assert!(orch.volumes(&shop).unwrap().is_empty());
    assert!(!orch.volumes(&blog).unwrap().is_empty());
    assert!(orch
        .runtime()
        .volume_list()
        .unwrap()
        .iter()
        .any(|v| v.global));
}

#[test]
fn status_of_missing_container_is_not_an_error() {
    let orch = orchestrator(MockBackend::new());
    let status = orch.runtime().container_status("dockyard-none-app-x-1").unwrap();
    assert!(!status.running);
    assert!(!status.exists());
}

#[test]
fn stop_then_status_reports_not_running() {
    let dir = tempfile::tempdir().unwrap();
    let project = project(dir.path(), SHOP);
    let orch = orchestrator(MockBackend::new());
    start(&orch, &project);

    orch.stop(&project).unwrap();
    let statuses = orch.status(&project).unwrap();
    assert_eq!(statuses.len(), 3);
    assert!(statuses.iter().all(|s| s.status.exists() && !s.status.running));
}

#[test]
fn project_variables_reach_the_document() {
    let dir = tempfile::tempdir().unwrap();
    let source = SHOP.replace(
        "id = \"shop\"",
        "id = \"shop\"\n\n[variables]\nAPP_ENV = \"dev\"\nREGION = \"eu\"",
    );
    let project = project(dir.path(), &source);
    let orch = orchestrator(MockBackend::new());
    start(&orch, &project);

    let doc = document(&orch, &project, "main");
    let vars: BTreeMap<String, String> = serde_json::from_value(doc["variables"].clone()).unwrap();
    assert_eq!(vars["APP_ENV"], "dev");
    assert_eq!(vars["REGION"], "eu");
    assert_eq!(doc["application"]["name"], "main");
}
