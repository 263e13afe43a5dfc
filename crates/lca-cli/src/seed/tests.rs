use std::sync::Mutex;

use lca_common::seedinfo::SeedClusterInfo;
use lca_ostree::Deployment;

use super::cluster::MockSeedCluster;
use super::*;
use crate::testing::{temp_paths, MockOps, MockQuery};

const CRICTL_IMAGES: &str = r#"{
  "images": [
    {"id": "1", "repoTags": ["quay.io/openshift/etcd:4.16"], "repoDigests": ["quay.io/openshift/etcd@sha256:1"]},
    {"id": "2", "repoTags": [], "repoDigests": ["quay.io/openshift/ovn@sha256:2"]},
    {"id": "3", "repoTags": ["registry.redhat.io/redhat/redhat-operator-index:v4.16"]},
    {"id": "4", "repoTags": ["quay.io/custom/catalog:latest"]}
  ]
}"#;

const RECERT: &str = "quay.io/edge-infrastructure/recert:v0";

type Calls = Arc<Mutex<Vec<String>>>;

fn options(host: &Path) -> SeedOptions {
    SeedOptions {
        image: "quay.io/seeds/sno:4.16.1".to_string(),
        auth_file: "/var/lib/kubelet/config.json".to_string(),
        recert_image: RECERT.to_string(),
        skip_recert: true,
        backup_dir: BACKUP_DIR.to_string(),
        config_files_dir: host.join("no-config-files"),
    }
}

/// Host with a booted deployment whose origin file exists
fn seed_host() -> tempfile::TempDir {
    let host = tempfile::tempdir().expect("tempdir");
    let deploy = host.path().join("ostree/deploy/rhcos/deploy");
    std::fs::create_dir_all(&deploy).expect("mkdir");
    std::fs::write(deploy.join("abc.0.origin"), "[origin]\nrefspec=abc\n").expect("origin");
    std::fs::create_dir_all(host.path().join("var/tmp")).expect("mkdir");
    for dir in NODE_CERT_DIRS {
        std::fs::create_dir_all(host.path().join(dir.trim_start_matches('/'))).expect("certs");
    }
    host
}

fn booted_query() -> MockQuery {
    let mut query = MockQuery::new();
    query
        .expect_query_status()
        .returning(|| Ok(vec![Deployment::new("rhcos", "rhcos-abc.0", true)]));
    query
}

/// Ops that answer every host command, recording them as one line each
fn recording_ops(calls: Calls, crio: &'static str) -> MockOps {
    let mut ops = MockOps::new();
    let recorded = calls.clone();
    ops.expect_run_in_host_namespace()
        .returning(move |program, args| {
            recorded
                .lock()
                .expect("calls lock")
                .push(format!("{program} {}", args.join(" ")));
            Ok(match (program, args.first().map(String::as_str)) {
                ("crictl", Some("images")) => CRICTL_IMAGES.to_string(),
                _ => String::new(),
            })
        });
    ops.expect_run_bash_in_host_namespace()
        .returning(move |script| {
            calls.lock().expect("calls lock").push(script.to_string());
            Ok(if script.starts_with("systemctl is-active") {
                crio.to_string()
            } else {
                String::new()
            })
        });
    ops
}

fn healthy_cluster() -> MockSeedCluster {
    let mut cluster = MockSeedCluster::new();
    cluster
        .expect_catalog_images()
        .returning(|| Ok(vec!["quay.io/custom/catalog:latest".to_string()]));
    cluster.expect_cluster_info().returning(|recert| {
        Ok(SeedClusterInfo {
            version: "4.16.1".to_string(),
            cluster_name: "seed".to_string(),
            recert_image: recert.to_string(),
            ..Default::default()
        })
    });
    cluster.expect_delete_node().times(1).returning(|| Ok(()));
    cluster.expect_ovn_node_running().returning(|| Ok(false));
    cluster
}

fn creator(host: &Path, ops: MockOps, cluster: MockSeedCluster, options: SeedOptions) -> SeedCreator {
    SeedCreator::new(
        Arc::new(ops),
        Arc::new(booted_query()),
        Arc::new(cluster),
        temp_paths(host),
        options,
    )
}

#[test]
fn tags_are_preferred_over_digests() {
    let images = parse_crictl_images(CRICTL_IMAGES).expect("parse");
    assert_eq!(
        images,
        vec![
            "quay.io/openshift/etcd:4.16",
            "quay.io/openshift/ovn@sha256:2",
            "registry.redhat.io/redhat/redhat-operator-index:v4.16",
            "quay.io/custom/catalog:latest",
        ]
    );
}

#[test]
fn catalogs_are_dropped_and_recert_is_added() {
    let images = parse_crictl_images(CRICTL_IMAGES).expect("parse");
    let list = container_list(images, &["quay.io/custom/catalog:latest".to_string()], RECERT);
    assert_eq!(
        list,
        vec!["quay.io/openshift/etcd:4.16", "quay.io/openshift/ovn@sha256:2", RECERT]
    );
}

#[test]
fn recert_image_is_not_listed_twice() {
    let list = container_list(vec![RECERT.to_string()], &[], RECERT);
    assert_eq!(list, vec![RECERT]);
}

#[test]
fn var_backup_skips_node_local_state() {
    let steps = backup_steps(BACKUP_DIR);
    let names: Vec<_> = steps.iter().map(|(name, _)| *name).collect();
    assert_eq!(
        names,
        vec!["backup_var", "backup_etc", "backup_ostree", "backup_rpmostree", "backup_mco_config"]
    );
    let var = &steps[0].1;
    assert!(var.starts_with("tar czf /var/tmp/backup/var.tgz"));
    for path in VAR_BACKUP_EXCLUDES {
        assert!(var.contains(&format!("--exclude '{path}'")), "{path} not excluded");
    }
    assert!(steps[1].1.contains("grep -v 'cni/multus'"));
}

/// Story: a full run backs the node up into the backup directory, drops
/// node certificates, and builds a labelled seed image from it before
/// pushing with the given auth file.
#[tokio::test(start_paused = true)]
async fn story_seed_is_built_from_backups_and_pushed() {
    let host = seed_host();
    let calls: Calls = Arc::default();
    let seed = creator(
        host.path(),
        recording_ops(calls.clone(), "inactive"),
        healthy_cluster(),
        options(host.path()),
    );

    seed.create().await.expect("seed created");

    let backup = host.path().join("var/tmp/backup");
    let list = std::fs::read_to_string(backup.join(CONTAINER_LIST_FILE)).expect("list");
    assert_eq!(
        list,
        format!("quay.io/openshift/etcd:4.16\nquay.io/openshift/ovn@sha256:2\n{RECERT}\n")
    );
    for dir in [backup.clone(), host.path().join("var/seed_data")] {
        let info = SeedClusterInfo::from_json(&std::fs::read(dir.join("manifest.json")).expect("manifest"))
            .expect("parse");
        assert_eq!(info.version, "4.16.1");
        assert_eq!(info.recert_image, RECERT);
    }
    assert!(backup.join("ostree-abc.0.origin").exists());
    for dir in NODE_CERT_DIRS {
        assert!(!host.path().join(dir.trim_start_matches('/')).exists());
    }
    assert!(!host.path().join("var/tmp/seed.Containerfile").exists());

    let calls = calls.lock().expect("calls lock").clone();
    let position = |needle: &str| {
        calls
            .iter()
            .position(|c| c.starts_with(needle))
            .unwrap_or_else(|| panic!("{needle} not run: {calls:?}"))
    };
    let build = &calls[position("podman build")];
    assert!(build.contains("--label com.openshift.lifecycle-agent.seed_format_version=3"));
    assert!(build.ends_with(BACKUP_DIR));
    assert!(position("systemctl stop kubelet") < position("tar czf /var/tmp/backup/var.tgz"));
    assert!(position("rpm-ostree status") < position("podman build"));
    assert!(position("podman build") < position("podman push --authfile /var/lib/kubelet/config.json"));
    // crio was already down
    assert!(!calls.iter().any(|c| c.contains("crictl stop")));

    let checks = host.path().join("var/tmp/checks");
    for step in [STEP_CONTAINER_LIST, STEP_CLUSTER_INFO, STEP_DELETE_NODE, STEP_WAIT_OVN, "backup_var"] {
        assert!(checks.join(step).exists(), "{step} not recorded");
    }
    assert!(!checks.join(STEP_RECERT).exists());
}

/// Story: a rerun after a failed push skips every checkpointed step; only
/// the idempotent service stop and the build and push run again.
#[tokio::test(start_paused = true)]
async fn story_rerun_skips_completed_steps() {
    let host = seed_host();
    let checks = Checkpoints::new(host.path().join("var/tmp/checks"));
    for step in [STEP_CONTAINER_LIST, STEP_CLUSTER_INFO, STEP_DELETE_NODE, STEP_WAIT_OVN] {
        checks.record(step).await.expect("record");
    }
    for (step, _) in backup_steps(BACKUP_DIR) {
        checks.record(step).await.expect("record");
    }

    let calls: Calls = Arc::default();
    // No cluster expectations: any cluster call fails the test
    let seed = creator(
        host.path(),
        recording_ops(calls.clone(), "inactive"),
        MockSeedCluster::new(),
        options(host.path()),
    );
    seed.create().await.expect("seed created");

    let calls = calls.lock().expect("calls lock").clone();
    assert!(!calls.iter().any(|c| c.starts_with("tar ") || c.starts_with("crictl images")));
    assert!(calls.iter().any(|c| c.starts_with("podman push")));
}

/// Story: while crio is still active its containers are stopped, with a
/// retry when the first attempt fails, before crio itself is stopped.
#[tokio::test(start_paused = true)]
async fn story_running_containers_are_stopped_before_crio() {
    let host = seed_host();
    let calls: Calls = Arc::default();
    let mut ops = MockOps::new();
    let recorded = calls.clone();
    ops.expect_run_in_host_namespace().returning(move |program, args| {
        recorded
            .lock()
            .expect("calls lock")
            .push(format!("{program} {}", args.join(" ")));
        Ok(String::new())
    });
    let mut attempts = 0;
    ops.expect_run_bash_in_host_namespace().returning(move |script| {
        if script.starts_with("systemctl is-active") {
            return Ok("active".to_string());
        }
        attempts += 1;
        if attempts == 1 {
            Err(Error::command("crictl", "runtime busy"))
        } else {
            Ok(String::new())
        }
    });

    let seed = creator(host.path(), ops, MockSeedCluster::new(), options(host.path()));
    seed.stop_services().await.expect("services stopped");

    assert_eq!(
        *calls.lock().expect("calls lock"),
        vec![
            "systemctl stop kubelet",
            "systemctl disable kubelet",
            "systemctl stop crio.service",
        ]
    );
}

/// Story: ovnkube-node never going away does not block seed creation; the
/// wait gives up after its bound and leaves no marker.
#[tokio::test(start_paused = true)]
async fn story_ovn_wait_is_best_effort() {
    let host = seed_host();
    let mut cluster = MockSeedCluster::new();
    cluster
        .expect_catalog_images()
        .returning(|| Ok(Vec::new()));
    cluster
        .expect_cluster_info()
        .returning(|_| Ok(SeedClusterInfo { version: "4.16.1".to_string(), ..Default::default() }));
    cluster.expect_delete_node().returning(|| Ok(()));
    cluster.expect_ovn_node_running().returning(|| Ok(true));

    let seed = creator(
        host.path(),
        recording_ops(Arc::default(), "inactive"),
        cluster,
        options(host.path()),
    );
    seed.create().await.expect("seed created");

    let checks = host.path().join("var/tmp/checks");
    assert!(checks.join(STEP_DELETE_NODE).exists());
    assert!(!checks.join(STEP_WAIT_OVN).exists());
}

/// Story: with recert enabled the preserved signer keys land in the cert
/// backup directory, one file each.
#[tokio::test]
async fn story_crypto_is_written_to_the_cert_backup_dir() {
    let host = seed_host();
    let mut cluster = MockSeedCluster::new();
    cluster.expect_crypto_files().times(1).returning(|| {
        Ok(vec![("localhost-serving-signer.key".to_string(), "PEM".to_string())])
    });

    let seed = creator(
        host.path(),
        MockOps::new(),
        cluster,
        SeedOptions {
            skip_recert: false,
            ..options(host.path())
        },
    );
    seed.checkpoints
        .run_once(STEP_BACKUP_CERTS, || seed.backup_certs())
        .await
        .expect("backup");

    let key = host
        .path()
        .join("var/tmp/backupCertsDir/localhost-serving-signer.key");
    assert_eq!(std::fs::read_to_string(key).expect("key"), "PEM");
}
