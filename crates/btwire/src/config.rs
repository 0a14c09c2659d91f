//! Supervisor configuration.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::router::Delivery;
use crate::worker::{PythonSpawner, WorkerArtifact, WorkerSpawner};

/// Interpreter used when `BTWIRE_PYTHON` is unset.
pub const DEFAULT_PYTHON: &str = "python3";

/// Default buffer size of every route.
pub const DEFAULT_ROUTE_CAPACITY: usize = 128;

/// How long a freshly spawned worker has to report `IDLE`.
pub const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(30);

pub struct WorkerConfig {
    pub artifact: WorkerArtifact,
    pub route_capacity: usize,
    /// Delivery mode of the two worker output routers.
    pub delivery: Delivery,
    pub startup_timeout: Duration,
    pub spawner: Arc<dyn WorkerSpawner>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerConfig {
    pub fn new() -> Self {
        Self {
            artifact: WorkerArtifact::Embedded,
            route_capacity: DEFAULT_ROUTE_CAPACITY,
            delivery: Delivery::TrySend,
            startup_timeout: DEFAULT_STARTUP_TIMEOUT,
            spawner: Arc::new(PythonSpawner::default()),
        }
    }

    /// Build from `BTWIRE_*` environment variables.
    ///
    /// - `BTWIRE_PYTHON`: interpreter (default `python3`)
    /// - `BTWIRE_SUDO`: run through sudo when `1`/`true`
    /// - `BTWIRE_ADAPTER`: when set, restart bluetoothd and make this adapter discoverable first
    /// - `BTWIRE_WORKER_SCRIPT`: use this script instead of the bundled one
    /// - `BTWIRE_ROUTE_CAPACITY`: per-route buffer size
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let mut spawner = PythonSpawner::new(
            get("BTWIRE_PYTHON")
                .filter(|p| !p.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_PYTHON.to_string()),
        )
        .with_sudo(get("BTWIRE_SUDO").is_some_and(|v| is_truthy(&v)));
        if let Some(adapter) = get("BTWIRE_ADAPTER").filter(|a| !a.trim().is_empty()) {
            spawner = spawner.with_linux_adapter_setup(adapter.trim());
        }

        let mut config = Self::new().with_spawner(Arc::new(spawner));
        if let Some(script) = get("BTWIRE_WORKER_SCRIPT").filter(|s| !s.trim().is_empty()) {
            config = config.with_artifact(WorkerArtifact::Path(PathBuf::from(script)));
        }
        if let Some(raw) = get("BTWIRE_ROUTE_CAPACITY") {
            match raw.trim().parse::<usize>() {
                Ok(n) if n > 0 => config = config.with_route_capacity(n),
                _ => tracing::warn!(value = %raw, "Ignoring invalid BTWIRE_ROUTE_CAPACITY"),
            }
        }
        config
    }

    pub fn with_artifact(mut self, artifact: WorkerArtifact) -> Self {
        self.artifact = artifact;
        self
    }

    pub fn with_route_capacity(mut self, capacity: usize) -> Self {
        self.route_capacity = capacity.max(1);
        self
    }

    pub fn with_delivery(mut self, delivery: Delivery) -> Self {
        self.delivery = delivery;
        self
    }

    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    pub fn with_spawner(mut self, spawner: Arc<dyn WorkerSpawner>) -> Self {
        self.spawner = spawner;
        self
    }
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
