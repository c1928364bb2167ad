use super::{Handle, LaunchError, Launcher};
use crate::catalog::ServiceSpec;
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// In-memory launcher that records every call
pub struct MockLauncher {
    running: Mutex<BTreeMap<String, Handle>>,
    spawns: Mutex<HashMap<String, usize>>,
    stops: Mutex<Vec<String>>,
    fail_start: Mutex<BTreeSet<String>>,
    fail_stop: Mutex<BTreeSet<String>>,
    next_id: AtomicU64,
    available: AtomicBool,
}

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MockLauncher {
    pub fn new() -> Self {
        Self {
            running: Mutex::new(BTreeMap::new()),
            spawns: Mutex::new(HashMap::new()),
            stops: Mutex::new(Vec::new()),
            fail_start: Mutex::new(BTreeSet::new()),
            fail_stop: Mutex::new(BTreeSet::new()),
            next_id: AtomicU64::new(1000),
            available: AtomicBool::new(true),
        }
    }

    /// Makes every future start of `service` fail
    pub fn fail_start_of(&self, service: impl Into<String>) {
        guard(&self.fail_start).insert(service.into());
    }

    pub fn fail_stop_of(&self, service: impl Into<String>) {
        guard(&self.fail_stop).insert(service.into());
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Simulates a crash: the handle stays known but is no longer running
    pub fn crash(&self, service: &str) {
        guard(&self.running).remove(service);
    }

    pub fn running(&self) -> BTreeSet<String> {
        guard(&self.running).keys().cloned().collect()
    }

    pub fn spawn_count(&self, service: &str) -> usize {
        guard(&self.spawns).get(service).copied().unwrap_or(0)
    }

    pub fn total_spawns(&self) -> usize {
        guard(&self.spawns).values().sum()
    }

    pub fn stopped(&self) -> Vec<String> {
        guard(&self.stops).clone()
    }

    pub fn stop_count(&self) -> usize {
        guard(&self.stops).len()
    }
}

impl Default for MockLauncher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Launcher for MockLauncher {
    async fn start(&self, spec: &ServiceSpec) -> Result<Handle, LaunchError> {
        if guard(&self.fail_start).contains(&spec.name) {
            return Err(LaunchError::start_failed(
                &spec.name,
                "scripted start failure",
            ));
        }

        let mut running = guard(&self.running);
        if let Some(handle) = running.get(&spec.name) {
            return Ok(handle.clone());
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let handle = Handle::new(&spec.name, id.to_string());
        running.insert(spec.name.clone(), handle.clone());
        *guard(&self.spawns).entry(spec.name.clone()).or_insert(0) += 1;
        Ok(handle)
    }

    async fn stop(&self, handle: &Handle, _timeout: Duration) -> Result<(), LaunchError> {
        if guard(&self.fail_stop).contains(&handle.service) {
            return Err(LaunchError::stop_failed(
                &handle.service,
                "scripted stop failure",
            ));
        }

        let mut running = guard(&self.running);
        if running.get(&handle.service) == Some(handle) {
            running.remove(&handle.service);
            guard(&self.stops).push(handle.service.clone());
        }
        Ok(())
    }

    async fn is_running(&self, handle: &Handle) -> bool {
        guard(&self.running).get(&handle.service) == Some(handle)
    }

    async fn check_available(&self) -> Result<(), LaunchError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(LaunchError::Unavailable("mock backend disabled".to_string()))
        }
    }

    fn name(&self) -> &str {
        "mock"
    }
}
