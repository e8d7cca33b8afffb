use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;

use crate::traits::{PageWatcher, VerifierError};

/// How a scripted checkout page behaves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageScript {
    /// The page eventually shows this text.
    Shows(String),
    /// The page never shows anything.
    Hangs,
    /// Loading the page fails.
    Errors(String),
}

#[derive(Default)]
struct WatchCounters {
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

struct Watching(Arc<WatchCounters>);

impl Drop for Watching {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A [`PageWatcher`] over a fixed set of pages. Unknown URLs hang.
#[derive(Clone, Default)]
pub struct ScriptedWatcher {
    pages: HashMap<String, PageScript>,
    delay: Duration,
    counters: Arc<WatchCounters>,
}

impl ScriptedWatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_page<S: Into<String>>(mut self, url: S, script: PageScript) -> Self {
        self.pages.insert(url.into(), script);
        self
    }

    /// How long the page takes to load before its script plays.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// The number of `wait_for_marker` calls so far. A verification makes two: one per marker.
    pub fn calls(&self) -> usize {
        self.counters.calls.load(Ordering::SeqCst)
    }

    pub fn peak_in_flight(&self) -> usize {
        self.counters.peak_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PageWatcher for ScriptedWatcher {
    async fn wait_for_marker(&self, url: &str, marker: &str) -> Result<(), VerifierError> {
        self.counters.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.counters.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.counters.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        let _watching = Watching(Arc::clone(&self.counters));
        tokio::time::sleep(self.delay).await;
        match self.pages.get(url) {
            Some(PageScript::Shows(text)) if text == marker => Ok(()),
            Some(PageScript::Errors(e)) => Err(VerifierError::Watcher(e.clone())),
            _ => std::future::pending().await,
        }
    }
}
