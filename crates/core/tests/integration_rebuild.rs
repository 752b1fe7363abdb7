//! Integration tests for run and rebuild flows without Docker
//!
//! These drive the runner, hat builder and rebuild orchestrator together
//! against MockDocker.

use sail_core::docker::mock::{MockCall, MockDocker, MockOp};
use sail_core::errors::{RebuildError, SailError};
use sail_core::hat::{HatBuilder, HatDescriptor};
use sail_core::host::{HostCapabilities, HostEnv};
use sail_core::labels::{ContainerState, Labels};
use sail_core::port::FixedMappingLocator;
use sail_core::proxy::state::{PortCache, PortStatus, STARTUP_REFRESH_DEADLINE};
use sail_core::rebuild::{RebuildOptions, RebuildState, Rebuilder};
use sail_core::runner::{RunContext, Runner};
use std::path::PathBuf;
use tempfile::TempDir;

const BASE: &str = "codercom/ubuntu-dev";

struct World {
    dir: TempDir,
    ctx: RunContext,
    docker: MockDocker,
    local_dir: PathBuf,
}

fn world() -> World {
    let dir = TempDir::new().unwrap();
    let local_dir = dir.path().join("home/Projects/cdr/sail");
    std::fs::create_dir_all(&local_dir).unwrap();
    let ctx = RunContext {
        host: HostEnv {
            home: dir.path().join("home"),
            ..HostEnv::default()
        },
        capabilities: HostCapabilities::published(),
        meta_root: dir.path().join("meta"),
        code_server_bin: dir.path().join("code-server"),
    };
    let docker = MockDocker::new();
    docker.add_image(BASE, Labels::new());
    World {
        dir,
        ctx,
        docker,
        local_dir,
    }
}

fn runner(world: &World, hat: Option<String>) -> Runner {
    Runner {
        container_name: "cdr_sail".to_string(),
        hostname: "sail".to_string(),
        port: 8123,
        proxy_url: "http://127.0.0.1:9000".to_string(),
        project_local_dir: world.local_dir.clone(),
        project_name: "sail".to_string(),
        base_image: BASE.to_string(),
        hat,
    }
}

fn hat_dir(world: &World) -> PathBuf {
    let dir = world.dir.path().join("hats/zsh");
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("Dockerfile"), "FROM ubuntu\nRUN apt-get install -y zsh\n").unwrap();
    dir
}

#[tokio::test]
async fn test_rebuild_preserves_identity_and_state() {
    let w = world();
    let runner = runner(&w, None);
    runner.run(&w.docker, &w.ctx, BASE).await.unwrap();
    let before = w.docker.container("cdr_sail").unwrap();

    let locator = FixedMappingLocator;
    let mut rebuilder = Rebuilder::new(&w.docker, &locator, &w.ctx);
    let report = rebuilder
        .rebuild("cdr_sail", &RebuildOptions::default())
        .await
        .unwrap();
    assert_eq!(rebuilder.state(), RebuildState::Promoted);
    assert_eq!(report.image, BASE);

    assert_eq!(w.docker.container_names(), vec!["cdr_sail"]);
    let after = w.docker.container("cdr_sail").unwrap();
    assert_ne!(after.id, before.id);
    assert!(after.running);
    assert_eq!(after.hostname, "sail");
    assert_eq!(
        ContainerState::from_labels("cdr_sail", &after.labels).unwrap(),
        ContainerState::from_labels("cdr_sail", &before.labels).unwrap()
    );
}

#[tokio::test]
async fn test_failed_create_restores_original() {
    let w = world();
    runner(&w, None).run(&w.docker, &w.ctx, BASE).await.unwrap();
    let before = w.docker.container("cdr_sail").unwrap();

    w.docker.fail(MockOp::Create, 1);
    let locator = FixedMappingLocator;
    let mut rebuilder = Rebuilder::new(&w.docker, &locator, &w.ctx);
    let err = rebuilder
        .rebuild("cdr_sail", &RebuildOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        SailError::Rebuild(RebuildError::RolledBack { .. })
    ));
    assert_eq!(rebuilder.state(), RebuildState::RolledBack);

    assert_eq!(w.docker.container_names(), vec!["cdr_sail"]);
    let restored = w.docker.container("cdr_sail").unwrap();
    assert_eq!(restored.id, before.id);
    assert!(restored.running);
}

#[tokio::test]
async fn test_hat_image_reused_across_rebuilds() {
    let w = world();
    let hat = hat_dir(&w).display().to_string();

    let descriptor = HatDescriptor {
        base_image: BASE.to_string(),
        hat: Some(hat.clone()),
    };
    let builder = HatBuilder::new(&w.docker);
    let tag = builder.apply(&descriptor).await.unwrap();
    assert_eq!(builder.apply(&descriptor).await.unwrap(), tag);
    assert_eq!(w.docker.build_count(), 1);

    let dockerfile = w
        .docker
        .calls()
        .into_iter()
        .find_map(|c| match c {
            MockCall::Build { dockerfile, .. } => Some(dockerfile),
            _ => None,
        })
        .unwrap();
    assert!(dockerfile.starts_with(&format!("FROM {}\n", BASE)));

    runner(&w, Some(hat)).run(&w.docker, &w.ctx, &tag).await.unwrap();
    let locator = FixedMappingLocator;
    let report = Rebuilder::new(&w.docker, &locator, &w.ctx)
        .rebuild("cdr_sail", &RebuildOptions::default())
        .await
        .unwrap();
    assert_eq!(report.image, tag);
    assert_eq!(w.docker.build_count(), 1);
    assert_eq!(w.docker.container("cdr_sail").unwrap().image, tag);
}

#[tokio::test]
async fn test_proxy_url_override_is_recorded() {
    let w = world();
    runner(&w, None).run(&w.docker, &w.ctx, BASE).await.unwrap();

    let locator = FixedMappingLocator;
    let options = RebuildOptions {
        proxy_url: Some("http://127.0.0.1:9555".to_string()),
    };
    Rebuilder::new(&w.docker, &locator, &w.ctx)
        .rebuild("cdr_sail", &options)
        .await
        .unwrap();

    let labels = w.docker.container("cdr_sail").unwrap().labels;
    let state = ContainerState::from_labels("cdr_sail", &labels).unwrap();
    assert_eq!(state.proxy_url, "http://127.0.0.1:9555");
}

#[tokio::test]
async fn test_proxy_forked_before_run_finds_the_editor() {
    let w = world();
    let ports = PortCache::new();

    // `sail run` forks the proxy first; its startup refresh runs while the
    // container is still being created.
    let refresh = {
        let (ports, docker) = (ports.clone(), w.docker.clone());
        tokio::spawn(async move {
            ports
                .refresh(&FixedMappingLocator, &docker, "cdr_sail", STARTUP_REFRESH_DEADLINE)
                .await
        })
    };
    tokio::time::sleep(std::time::Duration::from_millis(300)).await;
    assert_eq!(ports.current(), PortStatus::Refreshing);

    runner(&w, None).run(&w.docker, &w.ctx, BASE).await.unwrap();

    assert_eq!(refresh.await.unwrap().unwrap(), 8123);
    assert_eq!(ports.current(), PortStatus::Ready(8123));
}
