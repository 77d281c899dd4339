//! Shared fixtures for composite scheduling tests

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use lattice_core::{ComponentArtifact, TaskContext, TaskDefinition};

/// Counts how many times its actions ran
#[derive(Clone, Default)]
pub struct Counter(Arc<AtomicUsize>);

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }

    pub fn bump(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

/// Tracks how many actions are doing work at once
#[derive(Clone, Default)]
pub struct Gauge {
    current: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl Gauge {
    pub fn new() -> Self {
        Self::default()
    }

    /// Do `millis` of work while counted as running
    pub async fn busy(&self, millis: u64) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(millis)).await;
        self.current.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

/// Task that sleeps for `millis` and counts its executions
pub fn sleeping(name: &str, millis: u64, counter: &Counter) -> TaskDefinition {
    let counter = counter.clone();
    TaskDefinition::new(name, move |_ctx| {
        let counter = counter.clone();
        async move {
            counter.bump();
            tokio::time::sleep(Duration::from_millis(millis)).await;
            anyhow::Ok(())
        }
    })
}

/// Task that fails after `millis`
pub fn failing(name: &str, millis: u64, message: &'static str) -> TaskDefinition {
    TaskDefinition::new(name, move |_ctx| async move {
        tokio::time::sleep(Duration::from_millis(millis)).await;
        Err::<(), _>(anyhow::anyhow!(message))
    })
}

/// Task whose action consumes another build's artifact
pub fn requiring(name: &str, build: &str, tasks: &[&str]) -> TaskDefinition {
    let artifact = ComponentArtifact::cross_build(build, format!("{build}-artifact"), tasks.iter().copied());
    TaskDefinition::new(name, move |ctx: TaskContext| {
        let artifact = artifact.clone();
        async move {
            ctx.build_artifact(&artifact).await?;
            anyhow::Ok(())
        }
    })
}

/// Fail the test instead of hanging forever on a deadlock
pub async fn within<F: std::future::Future>(future: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(10), future)
        .await
        .expect("composite build deadlocked")
}
