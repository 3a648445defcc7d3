#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use parking_lot::Mutex;
use remote_cache::prelude::*;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// One scripted answer of [`MockProvider`]
#[derive(Debug, Clone)]
pub struct Reply {
    delay: Duration,
    outcome: Result<u32, ErrorKind>,
    max_age: Option<Duration>,
    must_revalidate: bool,
}

impl Reply {
    pub fn value(value: u32) -> Self {
        Reply {
            delay: Duration::ZERO,
            outcome: Ok(value),
            max_age: None,
            must_revalidate: false,
        }
    }

    pub fn fail(kind: ErrorKind) -> Self {
        Reply {
            delay: Duration::ZERO,
            outcome: Err(kind),
            max_age: None,
            must_revalidate: false,
        }
    }

    pub fn after(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn max_age(mut self, max_age: Duration) -> Self {
        self.max_age = Some(max_age);
        self
    }

    pub fn must_revalidate(mut self) -> Self {
        self.must_revalidate = true;
        self
    }
}

/// Provider answering from a script, then from a fallback reply
pub struct MockProvider {
    loads: AtomicUsize,
    replies: Mutex<VecDeque<Reply>>,
    fallback: Mutex<Reply>,
    fail_writes: AtomicBool,
    write_delay: Mutex<Duration>,
    writes: Mutex<Vec<(String, u32)>>,
}

impl MockProvider {
    pub fn new(fallback: Reply) -> Self {
        MockProvider {
            loads: AtomicUsize::new(0),
            replies: Mutex::new(VecDeque::new()),
            fallback: Mutex::new(fallback),
            fail_writes: AtomicBool::new(false),
            write_delay: Mutex::new(Duration::ZERO),
            writes: Mutex::new(Vec::new()),
        }
    }

    pub fn scripted(replies: impl IntoIterator<Item = Reply>, fallback: Reply) -> Self {
        let provider = Self::new(fallback);
        provider.replies.lock().extend(replies);
        provider
    }

    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn set_fallback(&self, reply: Reply) {
        *self.fallback.lock() = reply;
    }

    pub fn push(&self, reply: Reply) {
        self.replies.lock().push_back(reply);
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn delay_writes(&self, delay: Duration) {
        *self.write_delay.lock() = delay;
    }

    pub fn writes(&self) -> Vec<(String, u32)> {
        self.writes.lock().clone()
    }
}

impl DataProvider<String, u32> for MockProvider {
    async fn load_data(&self, _key: &String) -> Result<DataLoadResult<u32>, ProviderError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        let scripted = self.replies.lock().pop_front();
        let reply = match scripted {
            Some(reply) => reply,
            None => self.fallback.lock().clone(),
        };
        if !reply.delay.is_zero() {
            tokio::time::sleep(reply.delay).await;
        }
        match reply.outcome {
            Ok(value) => Ok(DataLoadResult {
                data: value,
                must_revalidate: reply.must_revalidate,
                max_age: reply.max_age,
            }),
            Err(kind) => Err(ProviderError::new(kind, "scripted failure")),
        }
    }
}

impl DataWriter<String, u32> for MockProvider {
    async fn write_data(&self, key: &String, value: &u32) -> Result<(), ProviderError> {
        let delay = *self.write_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.writes.lock().push((key.clone(), *value));
        if self.fail_writes.load(Ordering::SeqCst) {
            Err(ProviderError::transient("write rejected"))
        } else {
            Ok(())
        }
    }
}

pub type MockCache = RemoteCache<String, u32, MockProvider>;

pub fn key(name: &str) -> String {
    name.to_string()
}

/// Options without retries or background refreshes, so tests control every fetch
pub fn quiet_options() -> CacheOptions {
    CacheOptions::default()
        .retry(false)
        .stale_time(Duration::from_secs(3600))
}

/// Wait until the subscription's entry satisfies `done`
pub async fn wait_until<P>(sub: &mut Subscription<String, u32, P>, done: impl Fn(&CacheEntry<String, u32>) -> bool)
where
    P: DataProvider<String, u32>,
{
    while !done(&sub.current()) {
        sub.changed().await.expect("entry detached while waiting");
    }
}

/// Let spawned tasks run until `done` holds, without advancing time
pub async fn settle(done: impl Fn() -> bool) {
    for _ in 0..100 {
        if done() {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("condition not reached");
}
