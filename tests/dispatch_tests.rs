//! Integration tests for admission and the worker pool: mutual exclusion
//! per composition, and regulator release after a failed build.

use std::sync::Arc;
use std::time::Duration;

use resource_tree_handler::cache::TreeCache;
use resource_tree_handler::dispatch::{BuildJob, BuildState, Dispatcher, Regulator};
use resource_tree_handler::models::Reference;

fn offline_client() -> kube::Client {
    let config = kube::Config::new("http://127.0.0.1:9".parse().unwrap());
    kube::Client::try_from(config).expect("client from static config")
}

fn composition_reference(uid: &str) -> Reference {
    Reference {
        api_version: "composition.krateo.io/v1".to_string(),
        kind: "ApplicationGroup".to_string(),
        resource: "applicationgroups".to_string(),
        name: "demo".to_string(),
        namespace: "default".to_string(),
        uid: uid.to_string(),
    }
}

fn build_job(uid: &str) -> BuildJob {
    let reference = composition_reference(uid);
    let resource = resource_tree_handler::kube::api_resource(&reference);
    let composition = kube::core::DynamicObject::new("demo", &resource).within("default");
    BuildJob {
        composition,
        reference,
        composition_id: uid.to_string(),
    }
}

#[tokio::test]
async fn concurrent_admissions_have_a_single_winner() {
    let regulator = Arc::new(Regulator::new());
    let mut tasks = Vec::new();
    for _ in 0..64 {
        let regulator = regulator.clone();
        tasks.push(tokio::spawn(async move { regulator.try_admit("contended") }));
    }
    let mut admitted = 0;
    for task in tasks {
        if task.await.unwrap() {
            admitted += 1;
        }
    }
    assert_eq!(admitted, 1);
    assert_eq!(regulator.state("contended"), Some(BuildState::Queued));
}

#[tokio::test]
async fn worker_releases_regulator_after_failed_build() {
    let client = offline_client();
    let cache = TreeCache::new();
    let regulator = Arc::new(Regulator::new());
    let dispatcher = Dispatcher::spawn_with(client, cache, regulator.clone(), 2, 16);

    assert!(regulator.try_admit("job-1"));
    dispatcher.enqueue(build_job("job-1")).await.unwrap();

    // The build fails against the offline cluster; the worker must log it
    // and release admission so the next build can be queued.
    let mut released = false;
    for _ in 0..100 {
        if regulator.state("job-1").is_none() {
            released = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(released, "regulator still held after worker completion");
    assert!(regulator.try_admit("job-1"));
}

#[tokio::test]
async fn workers_survive_failures_and_keep_draining() {
    let client = offline_client();
    let cache = TreeCache::new();
    let regulator = Arc::new(Regulator::new());
    let dispatcher = Dispatcher::spawn_with(client, cache, regulator.clone(), 2, 64);

    for index in 0..8 {
        let id = format!("burst-{}", index);
        assert!(regulator.try_admit(&id));
        dispatcher.enqueue(build_job(&id)).await.unwrap();
    }

    let mut drained = false;
    for _ in 0..200 {
        let all_released = (0..8).all(|index| {
            regulator.state(&format!("burst-{}", index)).is_none()
        });
        if all_released {
            drained = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(drained, "queue not drained after worker failures");
}
