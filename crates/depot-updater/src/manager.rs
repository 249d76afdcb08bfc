//! UpdateManager: intake of discovered versions and the periodic sweeps.
//!
//! Intake is the only place discovered versions change status:
//!
//! | stored status        | auto-promote | action                                   |
//! |----------------------|--------------|------------------------------------------|
//! | absent               | any          | add, then as `empty`                     |
//! | `empty`              | any          | `pendingimport[-willmap]`                |
//! | `pendingimport`      | yes          | `pendingimport-willmap`                  |
//! | `imported`           | yes          | map prefix, keep `imported`              |
//! | `imported-willmap`   | any          | map prefix, `imported`                   |
//!
//! Everything else is left alone. Intake is serialized, so replaying a
//! report never applies a transition twice.

use std::sync::Arc;
use std::time::Duration;

use chrono::Duration as Age;
use depot_core::{EnvMode, NewVersion, Version, VersionStatus, to_environment};
use depot_gateway::Importer;
use depot_versions::VersionManager;
use futures_util::StreamExt;
use futures_util::future::join_all;
use futures_util::stream;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::error::UpdaterResult;
use crate::registry::build_updaters;
use crate::runner::run_updater;
use crate::DiscoveredVersion;

/// Superseded versions younger than this, relative to the active one, are kept.
const RETENTION_DAYS: i64 = 7;

/// Timers for the two sweeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweepSchedule {
    /// Delay before the first import sweep.
    pub first_check: Duration,
    pub check_every: Duration,
    pub old_check_every: Duration,
}

impl Default for SweepSchedule {
    fn default() -> Self {
        Self {
            first_check: Duration::from_secs(30),
            check_every: Duration::from_secs(10 * 60),
            old_check_every: Duration::from_secs(5 * 60),
        }
    }
}

pub struct UpdateManager {
    versions: Arc<VersionManager>,
    importer: Option<Arc<dyn Importer>>,
    intake: Mutex<()>,
    schedule: SweepSchedule,
}

impl UpdateManager {
    pub fn new(versions: Arc<VersionManager>, importer: Option<Arc<dyn Importer>>) -> Self {
        Self {
            versions,
            importer,
            intake: Mutex::new(()),
            schedule: SweepSchedule::default(),
        }
    }

    pub fn with_schedule(mut self, schedule: SweepSchedule) -> Self {
        self.schedule = schedule;
        self
    }

    /// Start every enabled updater and both sweeps, and run until shutdown.
    pub async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) {
        let (events, mut found) = mpsc::channel::<DiscoveredVersion>(64);
        let mut tasks = Vec::new();

        for (updater, schedule) in build_updaters(self.versions.config()) {
            tasks.push(tokio::spawn(run_updater(
                updater,
                schedule,
                events.clone(),
                shutdown.clone(),
            )));
        }
        drop(events);

        let intake = {
            let this = self.clone();
            let mut shutdown = shutdown.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        next = found.recv() => match next {
                            Some(version) => {
                                if let Err(e) = this.callback(&version).await {
                                    error!(prefix = %version.prefix, version = %version.version, error = %e, "could not record version");
                                }
                            }
                            None => break,
                        },
                        _ = shutdown.changed() => break,
                    }
                }
            })
        };
        tasks.push(intake);

        info!(secs = self.schedule.first_check.as_secs(), "checking versions soon");
        let check = {
            let this = self.clone();
            let mut shutdown = shutdown.clone();
            let mut timer = tokio::time::interval_at(
                Instant::now() + this.schedule.first_check,
                this.schedule.check_every,
            );
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = timer.tick() => this.check_versions().await,
                        _ = shutdown.changed() => break,
                    }
                }
            })
        };
        tasks.push(check);

        info!(secs = self.schedule.old_check_every.as_secs(), "checking old versions periodically");
        let old = {
            let this = self.clone();
            let mut shutdown = shutdown;
            let mut timer = tokio::time::interval_at(
                Instant::now() + this.schedule.old_check_every,
                this.schedule.old_check_every,
            );
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = timer.tick() => this.check_old_versions().await,
                        _ = shutdown.changed() => break,
                    }
                }
            })
        };
        tasks.push(old);

        join_all(tasks).await;
        info!("update manager stopped");
    }

    // ── Intake ─────────────────────────────────────────────────

    /// Record a version reported by an updater.
    pub async fn callback(&self, found: &DiscoveredVersion) -> UpdaterResult<()> {
        let _guard = self.intake.lock().await;
        let DiscoveredVersion {
            prefix,
            version,
            auto_promote,
        } = found;

        let Some(updater) = self.versions.config().updaters.get(prefix) else {
            warn!(%prefix, %version, "no updater configured for prefix, ignoring version");
            return Ok(());
        };

        let check = self.versions.check_version_exists(prefix, version).await;
        let id = check.id;
        let status = if check.exists {
            info!(%prefix, %version, "version already exists");
            self.versions.get_version(&id).await?.status
        } else {
            let new = NewVersion {
                prefix: prefix.clone(),
                version: version.clone(),
                shapes_container: updater.shapes_container.clone(),
                shapes_region: updater.shapes_region.clone(),
                dbconfig: updater.dbconfig.clone(),
                new_realtime: true,
            };
            if self.versions.add_version(&new).await?.is_none() {
                return Ok(());
            }
            VersionStatus::Empty
        };

        match status {
            VersionStatus::Empty => {
                self.versions
                    .update_version_status(&id, VersionStatus::pending(*auto_promote))
                    .await?;
            }
            VersionStatus::PendingImport if *auto_promote => {
                info!(%prefix, %id, "version will be mapped once imported");
                self.versions
                    .update_version_status(&id, VersionStatus::PendingImportWillMap)
                    .await?;
            }
            VersionStatus::Imported if *auto_promote => self.promote(prefix, &id, status).await?,
            VersionStatus::ImportedWillMap => self.promote(prefix, &id, status).await?,
            _ => debug!(%prefix, %id, %status, "nothing to do"),
        }
        Ok(())
    }

    /// Map `prefix` to `id` unless it already is, and settle on `imported`.
    async fn promote(&self, prefix: &str, id: &str, status: VersionStatus) -> UpdaterResult<()> {
        if self.versions.mapped_version(prefix).await.as_deref() == Some(id) {
            debug!(prefix, id, "already mapped");
        } else {
            info!(prefix, id, "updating mapping");
            self.versions.update_mapping(prefix, id).await?;
        }
        if status != VersionStatus::Imported {
            self.versions
                .update_version_status(id, VersionStatus::Imported)
                .await?;
        }
        Ok(())
    }

    // ── Sweeps ─────────────────────────────────────────────────

    /// Start imports for pending versions and map imported-willmap ones.
    pub async fn check_versions(&self) {
        let versions = self.versions.all_versions().await;
        debug!(count = versions.len(), "checking versions");
        stream::iter(versions)
            .for_each_concurrent(self.concurrency(), |(id, version)| async move {
                if version.status.is_pending_import() {
                    self.start_import(&id, &version).await;
                } else if version.status == VersionStatus::ImportedWillMap {
                    if let Err(e) = self.promote(&version.prefix, &id, version.status).await {
                        error!(prefix = %version.prefix, %id, error = %e, "could not map version");
                    }
                }
            })
            .await;
    }

    async fn start_import(&self, id: &str, version: &Version) {
        let Some(importer) = &self.importer else {
            match self.versions.docker_command(id).await {
                Ok(command) => info!(prefix = %version.prefix, id, %command, "no importer configured, run the import manually"),
                Err(e) => error!(id, error = %e, "could not render import command"),
            }
            return;
        };
        let config = match self.versions.get_version_config(id).await {
            Ok(config) => config,
            Err(e) => {
                error!(id, error = %e, "could not build import config");
                return;
            }
        };
        info!(prefix = %version.prefix, id, status = %version.status, "starting import task");
        if let Err(e) = importer
            .start_task(to_environment(&config, EnvMode::Importer))
            .await
        {
            error!(prefix = %version.prefix, id, error = %e, "could not start import task");
        }
    }

    /// Delete imported versions that have been superseded for a week.
    pub async fn check_old_versions(&self) {
        if !self.versions.config().delete_old_versions {
            debug!("old version deletion disabled");
            return;
        }
        let versions = self.versions.all_versions().await;
        let mappings = self.versions.all_mappings().await;

        let expired: Vec<String> = versions
            .iter()
            .filter(|(_, version)| version.status == VersionStatus::Imported)
            .filter_map(|(id, version)| {
                let active_id = &mappings.get(&version.prefix)?.value;
                if active_id == id {
                    return None;
                }
                let Some(active) = versions.get(active_id) else {
                    warn!(prefix = %version.prefix, active = %active_id, "mapped version missing, skipping");
                    return None;
                };
                (active.created_at - version.created_at >= Age::days(RETENTION_DAYS)).then(|| id.clone())
            })
            .collect();

        stream::iter(expired)
            .for_each_concurrent(self.concurrency(), |id| async move {
                info!(%id, "deleting old version");
                if let Err(e) = self.versions.delete_worker(&id).await {
                    error!(%id, error = %e, "could not delete old version");
                }
            })
            .await;
    }

    fn concurrency(&self) -> usize {
        self.versions.config().sweep_concurrency.max(1)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use depot_core::{DbConfig, DbTemplate, OrchestratorConfig, UpdaterConfig};
    use depot_state::{KeyValueStore, Tables};
    use depot_versions::testing::{FakeDatabaseAdmin, RecordingGateway, RecordingImporter};
    use serde_json::json;

    use super::*;

    struct Harness {
        updates: Arc<UpdateManager>,
        versions: Arc<VersionManager>,
        gateway: Arc<RecordingGateway>,
        importer: Arc<RecordingImporter>,
        admin: Arc<FakeDatabaseAdmin>,
        tables: Tables,
    }

    fn harness_with(configure: impl FnOnce(&mut OrchestratorConfig), with_importer: bool) -> Harness {
        let mut config = OrchestratorConfig::default();
        config.db.insert(
            "local".into(),
            DbTemplate {
                server: "localhost".into(),
                user: "depot".into(),
                password: "pw".into(),
            },
        );
        config.updaters.insert(
            "nz-akl".into(),
            UpdaterConfig {
                kind: Some("nz-akl".into()),
                enabled: false,
                dbconfig: "local".into(),
                shapes_container: "shapes".into(),
                shapes_region: "ap-southeast-2".into(),
                ..UpdaterConfig::default()
            },
        );
        configure(&mut config);

        let tables = Tables::in_memory().unwrap();
        let gateway = Arc::new(RecordingGateway::observing(tables.mappings.clone()));
        let admin = Arc::new(FakeDatabaseAdmin::default());
        let importer = Arc::new(RecordingImporter::default());
        let versions = Arc::new(VersionManager::new(
            Arc::new(config),
            &tables,
            gateway.clone(),
            admin.clone(),
        ));
        let dyn_importer: Option<Arc<dyn Importer>> = if with_importer {
            Some(importer.clone() as Arc<dyn Importer>)
        } else {
            None
        };
        let updates = Arc::new(UpdateManager::new(versions.clone(), dyn_importer));
        Harness {
            updates,
            versions,
            gateway,
            importer,
            admin,
            tables,
        }
    }

    fn harness() -> Harness {
        harness_with(|_| {}, true)
    }

    fn found(version: &str, auto_promote: bool) -> DiscoveredVersion {
        DiscoveredVersion {
            prefix: "nz-akl".into(),
            version: version.into(),
            auto_promote,
        }
    }

    async fn status(h: &Harness, id: &str) -> VersionStatus {
        h.versions.get_version(id).await.unwrap().status
    }

    /// Store a version directly, backdated by `age_days`.
    async fn seed(h: &Harness, id: &str, age_days: i64, status: VersionStatus) {
        let created = Utc::now() - Age::days(age_days);
        let version = Version {
            prefix: "nz-akl".into(),
            version: id.into(),
            created_at: created,
            updated_at: created,
            shapes_container: String::new(),
            shapes_region: String::new(),
            status,
            db: DbConfig {
                server: "localhost".into(),
                user: "depot".into(),
                password: "pw".into(),
                database: id.into(),
            },
            new_realtime: true,
        };
        assert!(
            h.tables
                .versions
                .set(id, &serde_json::to_value(&version).unwrap())
                .await
        );
    }

    async fn map(h: &Harness, prefix: &str, id: &str) {
        assert!(h.tables.mappings.set(prefix, &json!({ "value": id })).await);
    }

    // ── Intake ─────────────────────────────────────────────────

    #[tokio::test]
    async fn new_version_becomes_pending() {
        let h = harness();
        h.updates.callback(&found("2024-01-01_v1", false)).await.unwrap();

        let version = h.versions.get_version("nz_akl_2024_01_01_v1").await.unwrap();
        assert_eq!(version.status, VersionStatus::PendingImport);
        assert_eq!(version.shapes_container, "shapes");
        assert_eq!(version.db.database, "nz_akl_2024_01_01_v1");
        assert!(version.new_realtime);

        h.updates.callback(&found("2024-01-02_v1", true)).await.unwrap();
        assert_eq!(
            status(&h, "nz_akl_2024_01_02_v1").await,
            VersionStatus::PendingImportWillMap
        );
        assert!(h.gateway.calls().is_empty());
    }

    #[tokio::test]
    async fn repeated_reports_are_idempotent() {
        let h = harness();
        for _ in 0..3 {
            h.updates.callback(&found("v1", false)).await.unwrap();
        }
        assert_eq!(status(&h, "nz_akl_v1").await, VersionStatus::PendingImport);
        assert_eq!(h.versions.all_versions().await.len(), 1);

        // Concurrent duplicates still apply each transition once.
        let reports = (0..4).map(|_| {
            let updates = h.updates.clone();
            tokio::spawn(async move { updates.callback(&found("v1", true)).await })
        });
        for report in join_all(reports).await {
            report.unwrap().unwrap();
        }
        assert_eq!(
            status(&h, "nz_akl_v1").await,
            VersionStatus::PendingImportWillMap
        );
        assert!(h.gateway.calls().is_empty());
    }

    #[tokio::test]
    async fn imported_version_is_mapped_when_current() {
        let h = harness();
        h.updates.callback(&found("v1", false)).await.unwrap();
        h.versions
            .update_version_status("nz_akl_v1", VersionStatus::Imported)
            .await
            .unwrap();

        h.updates.callback(&found("v1", false)).await.unwrap();
        assert!(h.versions.mapped_version("nz-akl").await.is_none());

        h.updates.callback(&found("v1", true)).await.unwrap();
        h.updates.callback(&found("v1", true)).await.unwrap();
        assert_eq!(
            h.versions.mapped_version("nz-akl").await.as_deref(),
            Some("nz_akl_v1")
        );
        assert_eq!(status(&h, "nz_akl_v1").await, VersionStatus::Imported);
        assert_eq!(h.gateway.starts_for("nz-akl"), 1);
    }

    #[tokio::test]
    async fn imported_willmap_is_mapped_regardless() {
        let h = harness();
        h.updates.callback(&found("v1", false)).await.unwrap();
        h.versions
            .update_version_status("nz_akl_v1", VersionStatus::ImportedWillMap)
            .await
            .unwrap();

        h.updates.callback(&found("v1", false)).await.unwrap();
        assert_eq!(
            h.versions.mapped_version("nz-akl").await.as_deref(),
            Some("nz_akl_v1")
        );
        assert_eq!(status(&h, "nz_akl_v1").await, VersionStatus::Imported);
    }

    #[tokio::test]
    async fn importing_version_is_left_alone() {
        let h = harness();
        h.updates.callback(&found("v1", false)).await.unwrap();
        h.versions
            .update_version_status("nz_akl_v1", VersionStatus::Importing)
            .await
            .unwrap();
        h.updates.callback(&found("v1", true)).await.unwrap();
        assert_eq!(status(&h, "nz_akl_v1").await, VersionStatus::Importing);
    }

    #[tokio::test]
    async fn unknown_prefix_or_db_template_writes_nothing() {
        let h = harness_with(
            |config| {
                config.updaters.get_mut("nz-akl").unwrap().dbconfig = "missing".into();
            },
            true,
        );
        h.updates.callback(&found("v1", true)).await.unwrap();
        h.updates
            .callback(&DiscoveredVersion {
                prefix: "nz-wlg".into(),
                version: "v1".into(),
                auto_promote: true,
            })
            .await
            .unwrap();
        assert!(h.versions.all_versions().await.is_empty());
    }

    // ── Import sweep ───────────────────────────────────────────

    #[tokio::test]
    async fn pending_versions_are_sent_to_the_importer() {
        let h = harness();
        h.updates.callback(&found("v1", false)).await.unwrap();
        h.updates.callback(&found("v2", true)).await.unwrap();
        seed(&h, "nz_akl_v0", 1, VersionStatus::Importing).await;

        h.updates.check_versions().await;

        let mut tasks = h.importer.tasks();
        tasks.sort_by(|a, b| a["VERSION"].cmp(&b["VERSION"]));
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0]["VERSION"], "v1");
        assert_eq!(tasks[1]["VERSION"], "v2");
        assert_eq!(tasks[0]["PREFIX"], "nz-akl");
        assert_eq!(tasks[0]["KEYVALUE_VERSION_TABLE"], "depot-versions");
        assert_eq!(tasks[0]["DB_DATABASE"], "nz_akl_v1");
        // The import job advances the status itself.
        assert_eq!(status(&h, "nz_akl_v1").await, VersionStatus::PendingImport);
        assert_eq!(status(&h, "nz_akl_v0").await, VersionStatus::Importing);
    }

    #[tokio::test]
    async fn sweep_leaves_settled_and_in_flight_versions_alone() {
        let h = harness();
        let seeded = [
            ("nz_akl_v1", VersionStatus::Empty),
            ("nz_akl_v2", VersionStatus::Importing),
            ("nz_akl_v3", VersionStatus::ImportingWillMap),
            ("nz_akl_v4", VersionStatus::Imported),
        ];
        for (id, status) in seeded {
            seed(&h, id, 1, status).await;
        }
        let before = h.tables.versions.scan().await;

        h.updates.check_versions().await;

        for (id, expected) in seeded {
            assert_eq!(status(&h, id).await, expected, "{id}");
        }
        assert_eq!(h.tables.versions.scan().await, before);
        assert!(h.importer.tasks().is_empty());
        assert!(h.versions.all_mappings().await.is_empty());
        assert!(h.gateway.calls().is_empty());
    }

    #[tokio::test]
    async fn importer_failures_and_absence_leave_status_alone() {
        let h = harness();
        h.updates.callback(&found("v1", false)).await.unwrap();
        h.importer.set_failing(true);
        h.updates.check_versions().await;
        assert_eq!(status(&h, "nz_akl_v1").await, VersionStatus::PendingImport);

        let manual = harness_with(|_| {}, false);
        manual.updates.callback(&found("v1", false)).await.unwrap();
        manual.updates.check_versions().await;
        assert_eq!(status(&manual, "nz_akl_v1").await, VersionStatus::PendingImport);
        assert!(manual.importer.tasks().is_empty());
    }

    #[tokio::test]
    async fn end_to_end_promotion() {
        let h = harness();
        let id = h
            .versions
            .add_version(&NewVersion {
                prefix: "nz-akl".into(),
                version: "2024-01-01_v1".into(),
                shapes_container: "shapes".into(),
                shapes_region: "ap-southeast-2".into(),
                dbconfig: "local".into(),
                new_realtime: false,
            })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(id, "nz_akl_2024_01_01_v1");
        assert_eq!(status(&h, &id).await, VersionStatus::Empty);

        h.versions
            .update_version_status(&id, VersionStatus::ImportedWillMap)
            .await
            .unwrap();
        h.updates.check_versions().await;

        assert_eq!(h.versions.all_mappings().await["nz-akl"].value, id);
        assert_eq!(status(&h, &id).await, VersionStatus::Imported);
        assert_eq!(h.gateway.starts_for("nz-akl"), 1);
        assert_eq!(h.gateway.mapping_seen_at_start(), vec![true]);

        // A later sweep has nothing left to do.
        h.updates.check_versions().await;
        assert_eq!(h.gateway.starts_for("nz-akl"), 1);
    }

    // ── Old-version sweep ──────────────────────────────────────

    fn deleting(config: &mut OrchestratorConfig) {
        config.delete_old_versions = true;
    }

    #[tokio::test]
    async fn superseded_versions_are_deleted_after_a_week() {
        let h = harness_with(deleting, true);
        seed(&h, "active", 0, VersionStatus::Imported).await;
        seed(&h, "old", 8, VersionStatus::Imported).await;
        seed(&h, "recent", 3, VersionStatus::Imported).await;
        seed(&h, "stale_pending", 30, VersionStatus::PendingImport).await;
        map(&h, "nz-akl", "active").await;

        h.updates.check_old_versions().await;

        let remaining = h.versions.all_versions().await;
        assert!(!remaining.contains_key("old"));
        assert!(remaining.contains_key("active"));
        assert!(remaining.contains_key("recent"));
        assert!(remaining.contains_key("stale_pending"));
        assert_eq!(h.admin.dropped(), vec!["old".to_string()]);
    }

    #[tokio::test]
    async fn old_version_sweep_skips_unmapped_prefixes_and_when_disabled() {
        let h = harness_with(deleting, true);
        seed(&h, "old", 30, VersionStatus::Imported).await;
        h.updates.check_old_versions().await;
        assert!(h.versions.all_versions().await.contains_key("old"));

        // Mapped to a record that no longer exists.
        map(&h, "nz-akl", "gone").await;
        h.updates.check_old_versions().await;
        assert!(h.versions.all_versions().await.contains_key("old"));

        let disabled = harness();
        seed(&disabled, "active", 0, VersionStatus::Imported).await;
        seed(&disabled, "old", 30, VersionStatus::Imported).await;
        map(&disabled, "nz-akl", "active").await;
        disabled.updates.check_old_versions().await;
        assert_eq!(disabled.versions.all_versions().await.len(), 2);
        assert!(disabled.admin.dropped().is_empty());
    }

    #[tokio::test]
    async fn failed_drop_keeps_the_record() {
        let h = harness_with(deleting, true);
        seed(&h, "active", 0, VersionStatus::Imported).await;
        seed(&h, "old", 10, VersionStatus::Imported).await;
        map(&h, "nz-akl", "active").await;

        h.admin.fail_next();
        h.updates.check_old_versions().await;
        assert!(h.versions.all_versions().await.contains_key("old"));

        h.updates.check_old_versions().await;
        assert!(!h.versions.all_versions().await.contains_key("old"));
    }

    // ── Loop ───────────────────────────────────────────────────

    #[tokio::test]
    async fn run_sweeps_until_shutdown() {
        let h = harness();
        let updates = Arc::new(
            UpdateManager::new(h.versions.clone(), None).with_schedule(SweepSchedule {
                first_check: Duration::from_millis(10),
                check_every: Duration::from_millis(20),
                old_check_every: Duration::from_secs(3600),
            }),
        );
        h.updates.callback(&found("v1", false)).await.unwrap();
        h.versions
            .update_version_status("nz_akl_v1", VersionStatus::ImportedWillMap)
            .await
            .unwrap();

        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(updates.run(stop_rx));

        let deadline = Instant::now() + Duration::from_secs(5);
        while status(&h, "nz_akl_v1").await != VersionStatus::Imported {
            assert!(Instant::now() < deadline, "sweep never ran");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(
            h.versions.mapped_version("nz-akl").await.as_deref(),
            Some("nz_akl_v1")
        );

        stop_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
    }
}
