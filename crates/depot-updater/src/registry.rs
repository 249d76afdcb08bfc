//! Region code → updater strategy.

use std::sync::Arc;
use std::time::Duration;

use depot_core::{OrchestratorConfig, UpdaterConfig};
use tracing::{info, warn};

use crate::auckland::AucklandUpdater;
use crate::basic::BasicUpdater;
use crate::error::{UpdaterError, UpdaterResult};
use crate::runner::UpdaterSchedule;
use crate::RegionUpdater;

/// The closed set of updater strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdaterKind {
    /// Static GTFS archive polling.
    Basic,
    /// `nz-akl` versions API.
    Auckland,
}

impl UpdaterKind {
    /// Resolve an updater `type`. Omitted means basic; region codes without
    /// a strategy (`au-syd` among them) are unsupported.
    pub fn resolve(kind: Option<&str>) -> UpdaterResult<Self> {
        match kind {
            None | Some("basic") => Ok(Self::Basic),
            Some("nz-akl") => Ok(Self::Auckland),
            Some(other) => Err(UpdaterError::UnsupportedRegion(other.to_string())),
        }
    }

    pub fn build(
        self,
        prefix: &str,
        config: &UpdaterConfig,
        orchestrator: &OrchestratorConfig,
    ) -> UpdaterResult<Arc<dyn RegionUpdater>> {
        let timeout = Duration::from_millis(orchestrator.request_timeout);
        let updater: Arc<dyn RegionUpdater> = match self {
            Self::Basic => {
                let key = orchestrator.api.get(prefix).map(String::as_str);
                Arc::new(BasicUpdater::new(prefix, config, key, timeout)?)
            }
            Self::Auckland => {
                let key = orchestrator.api.get("nz-akl").map(String::as_str);
                Arc::new(AucklandUpdater::new(prefix, config, key, timeout)?)
            }
        };
        Ok(updater)
    }
}

/// Build an updater for every enabled region. Regions that are disabled or
/// fail to build are logged and skipped.
pub fn build_updaters(config: &OrchestratorConfig) -> Vec<(Arc<dyn RegionUpdater>, UpdaterSchedule)> {
    let mut updaters = Vec::new();
    for (prefix, updater) in &config.updaters {
        if !updater.enabled {
            info!(%prefix, "updater disabled");
            continue;
        }
        let built = UpdaterKind::resolve(updater.kind.as_deref())
            .and_then(|kind| kind.build(prefix, updater, config));
        match built {
            Ok(built) => {
                info!(%prefix, kind = updater.kind.as_deref().unwrap_or("basic"), "starting updater");
                updaters.push((built, UpdaterSchedule::from_config(updater)));
            }
            Err(e) => warn!(%prefix, error = %e, "could not start updater"),
        }
    }
    if updaters.is_empty() {
        info!("no updaters are turned on, versions will not update automatically");
    }
    updaters
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_known_kinds() {
        assert_eq!(UpdaterKind::resolve(None).unwrap(), UpdaterKind::Basic);
        assert_eq!(UpdaterKind::resolve(Some("basic")).unwrap(), UpdaterKind::Basic);
        assert_eq!(UpdaterKind::resolve(Some("nz-akl")).unwrap(), UpdaterKind::Auckland);
        assert!(matches!(
            UpdaterKind::resolve(Some("au-syd")),
            Err(UpdaterError::UnsupportedRegion(r)) if r == "au-syd"
        ));
    }

    #[test]
    fn skips_disabled_and_broken_regions() {
        let mut config = OrchestratorConfig::default();
        config.updaters.insert(
            "nz-wlg".into(),
            UpdaterConfig {
                url: Some("http://feeds.local/wlg.zip".into()),
                ..UpdaterConfig::default()
            },
        );
        config.updaters.insert(
            "nz-chc".into(),
            UpdaterConfig {
                enabled: false,
                url: Some("http://feeds.local/chc.zip".into()),
                ..UpdaterConfig::default()
            },
        );
        config.updaters.insert(
            "au-syd".into(),
            UpdaterConfig {
                kind: Some("au-syd".into()),
                ..UpdaterConfig::default()
            },
        );
        config.updaters.insert("nz-dud".into(), UpdaterConfig::default());
        config.updaters.insert(
            "nz-akl".into(),
            UpdaterConfig {
                kind: Some("nz-akl".into()),
                delay: 0,
                ..UpdaterConfig::default()
            },
        );

        let built = build_updaters(&config);
        let prefixes: Vec<&str> = built.iter().map(|(u, _)| u.prefix()).collect();
        assert_eq!(prefixes, vec!["nz-akl", "nz-wlg"]);
        assert_eq!(built[0].1.delay, Duration::ZERO);
        assert_eq!(built[1].1.interval, Duration::from_secs(1440 * 60));
    }
}
