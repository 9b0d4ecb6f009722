#![allow(dead_code)]

use async_trait::async_trait;
use automation_queue::{
    Application, Config, OperationRegistry, ProcessLauncher, ResourceClass, Scheduler, SessionContext,
};
use serde_json::{json, Value};
use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;

/// Fake launcher: sequential pids, records every kill.
#[derive(Default)]
pub struct FakeLauncher {
    next_pid: AtomicU32,
    killed: Mutex<Vec<u32>>,
}

impl FakeLauncher {
    pub fn killed(&self) -> Vec<u32> {
        self.killed.lock().unwrap().clone()
    }
}

#[async_trait]
impl ProcessLauncher for FakeLauncher {
    async fn start(&self, _application: Application, _working_dir: &Path) -> anyhow::Result<u32> {
        Ok(4000 + self.next_pid.fetch_add(1, Ordering::SeqCst))
    }

    async fn kill(&self, pid: u32) -> anyhow::Result<()> {
        self.killed.lock().unwrap().push(pid);
        Ok(())
    }
}

/// Operations whose progress the test controls.
///
/// `hold` records its payload label when it starts, then blocks until the
/// test releases a permit. `fail` always errors. `launch` binds an Excel
/// process to the session.
#[derive(Clone)]
pub struct Harness {
    pub gate: Arc<Semaphore>,
    pub started: Arc<Mutex<Vec<String>>>,
    pub running: Arc<AtomicUsize>,
    pub peak: Arc<AtomicUsize>,
}

impl Harness {
    pub fn new() -> Self {
        Self {
            gate: Arc::new(Semaphore::new(0)),
            started: Arc::new(Mutex::new(Vec::new())),
            running: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn started(&self) -> Vec<String> {
        self.started.lock().unwrap().clone()
    }

    pub fn release(&self, n: usize) {
        self.gate.add_permits(n);
    }

    /// Wait until `n` hold bodies have started.
    pub async fn wait_started(&self, n: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while self.started.lock().unwrap().len() < n {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("operations did not start in time");
    }

    pub fn operations(&self) -> OperationRegistry {
        let mut registry = OperationRegistry::new();
        for class in ResourceClass::ALL {
            let harness = self.clone();
            registry.register_fn(class, "hold", move |payload: Value, _session: SessionContext| {
                let harness = harness.clone();
                async move { harness.hold(payload).await }
            });
            registry.register_fn(class, "fail", |_payload: Value, _session: SessionContext| async {
                Err::<Value, _>(anyhow::anyhow!("workbook is read-only"))
            });
        }
        registry.register_fn(
            ResourceClass::ExclusiveAutomation,
            "launch",
            |_payload: Value, session: SessionContext| async move {
                let handle = session.acquire(Application::Excel).await?;
                Ok::<_, anyhow::Error>(json!({ "pid": handle.pid }))
            },
        );
        registry
    }

    async fn hold(&self, payload: Value) -> anyhow::Result<Value> {
        let label = payload.as_str().unwrap_or_default().to_string();
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        self.started.lock().unwrap().push(label.clone());

        let permit = self.gate.acquire().await;
        self.running.fetch_sub(1, Ordering::SeqCst);
        permit?.forget();
        Ok(json!(label))
    }
}

pub fn config(root: &Path) -> Config {
    let mut config = Config::default();
    config.work_root = root.to_path_buf();
    config.tick_interval_ms = 20;
    config
}

pub fn start(config: &Config, harness: &Harness) -> (Arc<FakeLauncher>, Scheduler) {
    let launcher = Arc::new(FakeLauncher::default());
    let scheduler = Scheduler::start(config, harness.operations(), launcher.clone());
    (launcher, scheduler)
}
