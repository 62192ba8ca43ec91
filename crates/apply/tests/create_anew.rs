use std::time::Duration;

use k8s_openapi::api::core::v1::{Container, Pod, PodSpec, PodStatus};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use keel_apply::{create_anew, create_anew_with, ApplyContext, BackoffPolicy, ObjectIdentity, Recreate, ResourceClient, Versioned};
use keel_store::{Fault, MemoryStore, Verb};
use tokio::time::Instant;

fn pod(image: &str) -> Pod {
    Pod {
        metadata: ObjectMeta { name: Some("nginx".into()), namespace: Some("test".into()), ..Default::default() },
        spec: Some(PodSpec {
            containers: vec![Container { name: "web".into(), image: Some(image.into()), ..Default::default() }],
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn id() -> ObjectIdentity { ObjectIdentity::new("test", "nginx") }

fn image_of(p: &Pod) -> &str {
    p.spec.as_ref().and_then(|s| s.containers.first()).and_then(|c| c.image.as_deref()).unwrap_or("")
}

fn ctx() -> ApplyContext { ApplyContext::new(BackoffPolicy::fixed(5, Duration::from_millis(30)).unwrap()) }

#[tokio::test(start_paused = true)]
async fn creates_when_absent() {
    let store = MemoryStore::<Pod>::new();
    let created = create_anew(&store, &ctx(), pod("nginx")).await.unwrap();
    assert!(created.uid().is_some());
    assert!(store.get(&id()).await.unwrap().semantic_eq(&pod("nginx")));
    assert_eq!(store.count(Verb::Delete), 1);
    assert_eq!(store.count(Verb::Create), 1);
}

#[tokio::test(start_paused = true)]
async fn replaces_differing_object() {
    let store = MemoryStore::<Pod>::new();
    let old = store.seed(pod("nginx"));

    let created = create_anew(&store, &ctx(), pod("apache")).await.unwrap();
    assert_ne!(created.uid(), old.uid());
    assert_ne!(created.version(), old.version());
    assert_eq!(image_of(&store.stored(&id()).unwrap()), "apache");

    let verbs: Vec<Verb> = store.actions().into_iter().map(|a| a.verb).collect();
    assert_eq!(verbs, vec![Verb::Delete, Verb::Create]);
}

#[tokio::test(start_paused = true)]
async fn stale_uid_and_version_on_input_are_dropped() {
    let store = MemoryStore::<Pod>::new();
    let old = store.seed(pod("nginx"));
    let mut desired = old.clone();
    desired.spec = pod("apache").spec;

    let created = create_anew(&store, &ctx(), desired).await.unwrap();
    assert_ne!(created.uid(), old.uid());
    assert_eq!(image_of(&created), "apache");
}

#[tokio::test(start_paused = true)]
async fn lingering_object_is_deleted_on_retry() {
    let store = MemoryStore::<Pod>::new();
    store.seed(pod("nginx"));
    // The first delete claims the object is already gone while it still exists.
    store.fail_next(Verb::Delete, Fault::NotFound);

    let t0 = Instant::now();
    create_anew(&store, &ctx(), pod("apache")).await.unwrap();
    assert_eq!(t0.elapsed(), Duration::from_millis(30));
    assert_eq!(store.count(Verb::Delete), 2);
    assert_eq!(store.count(Verb::Create), 2);
    assert_eq!(image_of(&store.stored(&id()).unwrap()), "apache");
}

#[tokio::test(start_paused = true)]
async fn delete_failure_is_fatal() {
    let store = MemoryStore::<Pod>::new();
    store.seed(pod("nginx"));
    store.fail_next(Verb::Delete, Fault::Unavailable("fake".into()));

    let err = create_anew(&store, &ctx(), pod("apache")).await.unwrap_err();
    assert!(err.to_string().contains("fake"), "err={}", err);
    assert_eq!(store.count(Verb::Create), 0);
    assert_eq!(image_of(&store.stored(&id()).unwrap()), "nginx");
}

#[tokio::test(start_paused = true)]
async fn persistent_already_exists_exhausts() {
    let store = MemoryStore::<Pod>::new();
    store.fail_always(Verb::Create, Fault::AlreadyExists);

    let t0 = Instant::now();
    let err = create_anew(&store, &ctx(), pod("nginx")).await.unwrap_err();
    assert!(err.is_already_exists(), "err={}", err);
    assert_eq!(store.count(Verb::Create), 5);
    assert_eq!(store.count(Verb::Delete), 5);
    assert_eq!(t0.elapsed(), Duration::from_millis(4 * 30));
}

#[tokio::test(start_paused = true)]
async fn create_failure_is_fatal() {
    let store = MemoryStore::<Pod>::new();
    store.seed(pod("nginx"));
    store.fail_next(Verb::Create, Fault::Unavailable("fake".into()));

    let t0 = Instant::now();
    let err = create_anew(&store, &ctx(), pod("apache")).await.unwrap_err();
    assert!(err.to_string().contains("fake"), "err={}", err);
    assert_eq!(t0.elapsed(), Duration::ZERO);
    assert!(store.is_empty());
}

#[tokio::test(start_paused = true)]
async fn always_mode_recreates_identical_object() {
    let store = MemoryStore::<Pod>::new();
    let old = store.seed(pod("nginx"));

    let created = create_anew(&store, &ctx(), pod("nginx")).await.unwrap();
    assert_ne!(created.uid(), old.uid());
    assert_eq!(store.count(Verb::Delete), 1);
}

#[tokio::test(start_paused = true)]
async fn if_changed_ignores_status_only_difference() {
    let store = MemoryStore::<Pod>::new();
    let mut running = pod("nginx");
    running.status = Some(PodStatus { phase: Some("Running".into()), ..Default::default() });
    let old = store.seed(running);

    let live = create_anew_with(&store, &ctx(), pod("nginx"), Recreate::IfChanged).await.unwrap();
    assert_eq!(live.uid(), old.uid());
    assert_eq!(store.count(Verb::Delete), 0);
    assert_eq!(store.count(Verb::Create), 0);
}

#[tokio::test(start_paused = true)]
async fn if_changed_recreates_on_spec_difference() {
    let store = MemoryStore::<Pod>::new();
    let old = store.seed(pod("nginx"));

    let created = create_anew_with(&store, &ctx(), pod("apache"), Recreate::IfChanged).await.unwrap();
    assert_ne!(created.uid(), old.uid());
    let verbs: Vec<Verb> = store.actions().into_iter().map(|a| a.verb).collect();
    assert_eq!(verbs, vec![Verb::Get, Verb::Delete, Verb::Create]);
}

#[tokio::test(start_paused = true)]
async fn if_changed_surfaces_read_failure() {
    let store = MemoryStore::<Pod>::new();
    store.fail_next(Verb::Get, Fault::Unavailable("fake".into()));

    let err = create_anew_with(&store, &ctx(), pod("nginx"), Recreate::IfChanged).await.unwrap_err();
    assert!(err.to_string().contains("fake"), "err={}", err);
    assert_eq!(store.actions().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn cancelled_before_start_makes_no_calls() {
    let store = MemoryStore::<Pod>::new();
    let ctx = ctx();
    ctx.cancel.cancel();
    let err = create_anew(&store, &ctx, pod("nginx")).await.unwrap_err();
    assert!(err.is_cancelled());
    assert!(store.actions().is_empty());
}
