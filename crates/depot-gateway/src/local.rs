//! Local gateway: workers as child processes of the orchestrator.
//!
//! Each prefix owns at most one live [`LocalWorker`]. Routing goes through
//! a [`RouteTable`] whose mount points are only ever added: a prefix is
//! mounted the first time a worker starts for it, and later starts rebind
//! the mount to the new worker instead of remounting. Requests for a mounted
//! prefix with no bound worker fall through.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use depot_core::{EnvMode, GatewayConfig, LocalGatewayConfig, to_environment};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{GatewayError, GatewayResult};
use crate::traits::Gateway;

// ── Route table ────────────────────────────────────────────────

/// Prefix → worker endpoint indirection consulted by the request router.
#[derive(Clone, Default)]
pub struct RouteTable {
    routes: Arc<RwLock<HashMap<String, Option<String>>>>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mount `prefix`. Returns false if it was already mounted.
    pub fn mount(&self, prefix: &str) -> bool {
        let mut routes = self.routes.write().expect("routes lock");
        if routes.contains_key(prefix) {
            return false;
        }
        routes.insert(prefix.to_string(), None);
        debug!(prefix, "route mounted");
        true
    }

    /// Point a mounted prefix at a worker endpoint.
    pub fn bind(&self, prefix: &str, endpoint: &str) {
        let mut routes = self.routes.write().expect("routes lock");
        if let Some(slot) = routes.get_mut(prefix) {
            *slot = Some(endpoint.to_string());
        }
    }

    pub fn unbind(&self, prefix: &str) {
        let mut routes = self.routes.write().expect("routes lock");
        if let Some(slot) = routes.get_mut(prefix) {
            *slot = None;
        }
    }

    /// Endpoint currently serving `prefix`, if any.
    pub fn resolve(&self, prefix: &str) -> Option<String> {
        let routes = self.routes.read().expect("routes lock");
        routes.get(prefix).cloned().flatten()
    }

    pub fn mounted(&self) -> Vec<String> {
        let routes = self.routes.read().expect("routes lock");
        let mut prefixes: Vec<String> = routes.keys().cloned().collect();
        prefixes.sort();
        prefixes
    }
}

// ── Workers ────────────────────────────────────────────────────

/// A running worker.
pub struct LocalWorker {
    pub endpoint: String,
    child: Option<Child>,
}

impl LocalWorker {
    pub fn new(endpoint: impl Into<String>, child: Option<Child>) -> Self {
        Self {
            endpoint: endpoint.into(),
            child,
        }
    }

    async fn stop(&mut self) -> GatewayResult<()> {
        if let Some(child) = self.child.as_mut() {
            child
                .kill()
                .await
                .map_err(|e| GatewayError::Spawn(e.to_string()))?;
        }
        Ok(())
    }
}

/// Starts worker processes.
#[async_trait]
pub trait WorkerSpawner: Send + Sync {
    async fn spawn(&self, prefix: &str, env: BTreeMap<String, String>) -> GatewayResult<LocalWorker>;
}

/// Spawns the configured worker binary, one port per start.
pub struct ProcessSpawner {
    config: LocalGatewayConfig,
    next_port: AtomicU16,
}

impl ProcessSpawner {
    pub fn new(config: LocalGatewayConfig) -> Self {
        let next_port = AtomicU16::new(config.base_port);
        Self { config, next_port }
    }
}

#[async_trait]
impl WorkerSpawner for ProcessSpawner {
    async fn spawn(&self, prefix: &str, env: BTreeMap<String, String>) -> GatewayResult<LocalWorker> {
        let port = self.next_port.fetch_add(1, Ordering::Relaxed);
        let child = Command::new(&self.config.program)
            .args(&self.config.args)
            .envs(&env)
            .env("PORT", port.to_string())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| GatewayError::Spawn(format!("{}: {e}", self.config.program.display())))?;

        let endpoint = format!("{}:{port}", self.config.host);
        info!(prefix, %endpoint, pid = child.id(), "worker process spawned");
        Ok(LocalWorker::new(endpoint, Some(child)))
    }
}

// ── Gateway ────────────────────────────────────────────────────

pub struct LocalGateway {
    spawner: Arc<dyn WorkerSpawner>,
    workers: Mutex<HashMap<String, LocalWorker>>,
    routes: RouteTable,
}

impl LocalGateway {
    pub fn new(spawner: Arc<dyn WorkerSpawner>) -> Self {
        Self {
            spawner,
            workers: Mutex::new(HashMap::new()),
            routes: RouteTable::new(),
        }
    }

    pub fn routes(&self) -> RouteTable {
        self.routes.clone()
    }

    pub async fn running(&self) -> Vec<String> {
        let workers = self.workers.lock().await;
        let mut prefixes: Vec<String> = workers.keys().cloned().collect();
        prefixes.sort();
        prefixes
    }
}

#[async_trait]
impl Gateway for LocalGateway {
    async fn start(&self, prefix: &str, config: &GatewayConfig) -> GatewayResult<()> {
        let env = to_environment(config, EnvMode::Worker);
        let mut workers = self.workers.lock().await;

        let replaced = match workers.remove(prefix) {
            Some(mut old) => {
                info!(prefix, "route already bound, stopping old worker");
                self.routes.unbind(prefix);
                if let Err(e) = old.stop().await {
                    warn!(prefix, error = %e, "old worker did not stop cleanly");
                }
                true
            }
            None => false,
        };

        let worker = self.spawner.spawn(prefix, env).await?;
        if !replaced {
            self.routes.mount(prefix);
        }
        self.routes.bind(prefix, &worker.endpoint);
        workers.insert(prefix.to_string(), worker);

        info!(prefix, version = %config.version, "local gateway started");
        Ok(())
    }

    async fn recycle(&self, prefix: &str, config: &GatewayConfig) -> GatewayResult<()> {
        self.stop(prefix).await?;
        self.start(prefix, config).await
    }

    async fn stop(&self, prefix: &str) -> GatewayResult<()> {
        let mut workers = self.workers.lock().await;
        let Some(mut worker) = workers.remove(prefix) else {
            warn!(prefix, "could not stop, no worker for prefix");
            return Ok(());
        };
        self.routes.unbind(prefix);
        worker.stop().await?;
        info!(prefix, "local gateway stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use depot_core::{GatewayDbConfig, KeyValueKind, StorageService, VersionStatus};

    use super::*;

    /// Hands out sequential fake endpoints without spawning anything.
    #[derive(Default)]
    struct FakeSpawner {
        spawned: AtomicUsize,
        envs: std::sync::Mutex<Vec<BTreeMap<String, String>>>,
    }

    #[async_trait]
    impl WorkerSpawner for FakeSpawner {
        async fn spawn(&self, _prefix: &str, env: BTreeMap<String, String>) -> GatewayResult<LocalWorker> {
            let n = self.spawned.fetch_add(1, Ordering::SeqCst);
            self.envs.lock().unwrap().push(env);
            Ok(LocalWorker::new(format!("127.0.0.1:{}", 9100 + n), None))
        }
    }

    fn config(version: &str) -> GatewayConfig {
        GatewayConfig {
            id: format!("nz_akl_{version}"),
            prefix: "nz-akl".into(),
            version: version.into(),
            status: VersionStatus::Imported,
            storage_service: StorageService::Local,
            shapes_container: String::new(),
            shapes_region: String::new(),
            api: Default::default(),
            new_realtime: false,
            redis: None,
            db: GatewayDbConfig {
                server: "db".into(),
                user: "sa".into(),
                password: "pw".into(),
                database: format!("nz_akl_{version}"),
                transaction_limit: 50_000,
                connection_timeout: 60_000,
                request_timeout: 60_000,
            },
            keyvalue: KeyValueKind::Local,
            keyvalue_prefix: "depot".into(),
            keyvalue_region: "us-west-2".into(),
        }
    }

    #[tokio::test]
    async fn start_mounts_once_and_rebinds() {
        let spawner = Arc::new(FakeSpawner::default());
        let gateway = LocalGateway::new(spawner.clone());
        let routes = gateway.routes();

        gateway.start("nz-akl", &config("v1")).await.unwrap();
        assert_eq!(routes.resolve("nz-akl").as_deref(), Some("127.0.0.1:9100"));

        gateway.start("nz-akl", &config("v2")).await.unwrap();
        assert_eq!(routes.resolve("nz-akl").as_deref(), Some("127.0.0.1:9101"));
        assert_eq!(routes.mounted(), vec!["nz-akl".to_string()]);
        assert_eq!(gateway.running().await, vec!["nz-akl".to_string()]);

        let envs = spawner.envs.lock().unwrap();
        assert_eq!(envs[1]["DB_DATABASE"], "nz_akl_v2");
    }

    #[tokio::test]
    async fn stop_unbinds_but_keeps_mount() {
        let gateway = LocalGateway::new(Arc::new(FakeSpawner::default()));
        let routes = gateway.routes();

        gateway.start("nz-akl", &config("v1")).await.unwrap();
        gateway.stop("nz-akl").await.unwrap();

        assert_eq!(routes.resolve("nz-akl"), None);
        assert_eq!(routes.mounted(), vec!["nz-akl".to_string()]);
        assert!(gateway.running().await.is_empty());

        // Starting again reuses the existing mount.
        gateway.start("nz-akl", &config("v1")).await.unwrap();
        assert!(routes.resolve("nz-akl").is_some());
        assert!(!routes.mount("nz-akl"));
    }

    #[tokio::test]
    async fn stop_unknown_prefix_is_noop() {
        let gateway = LocalGateway::new(Arc::new(FakeSpawner::default()));
        gateway.stop("au-syd").await.unwrap();
        assert!(gateway.routes().mounted().is_empty());
    }

    #[tokio::test]
    async fn recycle_restarts_worker() {
        let spawner = Arc::new(FakeSpawner::default());
        let gateway = LocalGateway::new(spawner.clone());

        gateway.start("nz-akl", &config("v1")).await.unwrap();
        gateway.recycle("nz-akl", &config("v1")).await.unwrap();

        assert_eq!(spawner.spawned.load(Ordering::SeqCst), 2);
        assert_eq!(gateway.routes().resolve("nz-akl").as_deref(), Some("127.0.0.1:9101"));
    }

    #[test]
    fn bind_requires_mount() {
        let routes = RouteTable::new();
        routes.bind("nz-akl", "127.0.0.1:1");
        assert_eq!(routes.resolve("nz-akl"), None);
    }
}
