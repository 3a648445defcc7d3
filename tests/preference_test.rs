mod support;

use std::sync::Arc;
use std::time::Duration;
use remote_cache::events::{CacheEvent, UpdateOrigin};
use remote_cache::preference::MemoryMirror;
use remote_cache::prelude::*;
use support::*;

#[tokio::test(start_paused = true)]
async fn optimistic_value_survives_rejected_write() {
    init_tracing();
    let cache = MockCache::new(MockProvider::new(Reply::value(1)), quiet_options());
    let k = key("pref:showControls");
    let mut sub = cache.subscribe(k.clone());
    wait_until(&mut sub, |entry| entry.value.is_some()).await;
    let fetched_at = sub.current().fetched_at;
    let mut events = cache.events();

    cache.provider().fail_writes(true);
    cache.provider().delay_writes(Duration::from_millis(50));
    cache.set_preference(k.clone(), 0);

    // visible before the write settles
    assert_eq!(sub.data().as_deref(), Some(&0));
    assert!(cache.provider().writes().is_empty());

    cache.flush_writes().await;
    tokio::time::sleep(Duration::from_millis(1)).await;

    assert_eq!(cache.provider().writes(), vec![(k.clone(), 0)]);
    assert_eq!(sub.data().as_deref(), Some(&0));
    assert_eq!(sub.current().fetched_at, fetched_at);
    assert_eq!(
        events.recv().await.unwrap(),
        CacheEvent::Updated { key: k.clone(), origin: UpdateOrigin::Local }
    );
    match events.recv().await.unwrap() {
        CacheEvent::WriteFailed { key, error } => {
            assert_eq!(key, k);
            assert_eq!(error.kind, ErrorKind::Transient);
        }
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn preference_reaches_every_subscriber_without_fetching() {
    let cache = MockCache::new(MockProvider::new(Reply::value(1)), quiet_options());
    let k = key("pref:cover");
    let mut first = cache.subscribe(k.clone());
    let second = cache.subscribe(k.clone());
    wait_until(&mut first, |entry| !entry.fetching).await;
    assert_eq!(cache.provider().loads(), 1);

    // a third party writes through its own handle
    cache.clone().set_preference(k.clone(), 2);

    assert_eq!(first.data().as_deref(), Some(&2));
    assert_eq!(second.data().as_deref(), Some(&2));
    cache.flush_writes().await;
    assert_eq!(cache.provider().loads(), 1);
}

#[tokio::test(start_paused = true)]
async fn writes_reach_the_remote_in_order() {
    let cache = MockCache::new(MockProvider::new(Reply::value(0)), quiet_options());
    let k = key("pref:volume");
    cache.provider().delay_writes(Duration::from_millis(5));

    for value in 1..=3 {
        cache.set_preference(k.clone(), value);
    }
    cache.flush_writes().await;

    assert_eq!(
        cache.provider().writes(),
        vec![(k.clone(), 1), (k.clone(), 2), (k.clone(), 3)]
    );
    assert_eq!(cache.get(&k).as_deref(), Some(&3));
}

#[tokio::test(start_paused = true)]
async fn preference_is_mirrored_locally() {
    let mirror = Arc::new(MemoryMirror::<String, u32>::new());
    let cache = MockCache::builder(MockProvider::new(Reply::value(0)))
        .options(quiet_options())
        .mirror(Arc::clone(&mirror))
        .build();
    let k = key("pref:lang");

    cache.set_preference(k.clone(), 4);

    assert_eq!(mirror.load(&k), Some(4));
}

#[tokio::test(start_paused = true)]
async fn in_flight_fetch_cannot_revert_a_preference() {
    let cache = MockCache::new(
        MockProvider::new(Reply::value(1).after(Duration::from_millis(100))),
        quiet_options(),
    );
    let k = key("pref:autoplay");
    let mut sub = cache.subscribe(k.clone());
    settle(|| cache.provider().loads() == 1).await;

    cache.set_preference(k.clone(), 0);
    wait_until(&mut sub, |entry| !entry.fetching).await;

    assert_eq!(sub.data().as_deref(), Some(&0));
    cache.flush_writes().await;
    assert_eq!(cache.provider().writes(), vec![(k, 0)]);
}

#[tokio::test(start_paused = true)]
async fn preference_survives_a_full_cache_of_subscribed_keys() {
    let cache = MockCache::new(MockProvider::new(Reply::value(1)), quiet_options().max_entries(1));
    let mut watched = cache.subscribe(key("pref:watched"));
    wait_until(&mut watched, |entry| entry.value.is_some()).await;

    let k = key("pref:x");
    cache.set_preference(k.clone(), 5);

    assert_eq!(cache.get(&k).as_deref(), Some(&5));
    assert_eq!(watched.data().as_deref(), Some(&1));
    cache.flush_writes().await;
    assert_eq!(cache.provider().writes(), vec![(k, 5)]);
}

#[tokio::test(start_paused = true)]
async fn preference_after_failed_fetch_is_no_longer_an_error() {
    let cache = MockCache::new(MockProvider::new(Reply::fail(ErrorKind::Permanent)), quiet_options());
    let k = key("pref:quality");
    let mut sub = cache.subscribe(k.clone());
    wait_until(&mut sub, |entry| !entry.fetching).await;
    assert_eq!(sub.status(), Status::Error);

    cache.set_preference(k.clone(), 720);

    assert_eq!(sub.data().as_deref(), Some(&720));
    assert_eq!(sub.status(), Status::Stale);
    assert!(sub.error().is_none());
    cache.flush_writes().await;
}

#[tokio::test]
async fn flush_without_writes_returns_immediately() {
    let cache = MockCache::new(MockProvider::new(Reply::value(0)), quiet_options());
    cache.flush_writes().await;
}
