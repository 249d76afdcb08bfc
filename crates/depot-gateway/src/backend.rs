//! Construct the configured gateway and importer.

use std::sync::Arc;

use depot_core::{GatewayBackendConfig, ImporterConfig};
use tracing::info;

use crate::ecs::EcsGateway;
use crate::error::GatewayResult;
use crate::fargate::FargateImporter;
use crate::kubernetes::{KubeClient, KubernetesGateway, KubernetesImporter};
use crate::local::{LocalGateway, ProcessSpawner};
use crate::traits::{Gateway, Importer};

async fn sdk_config() -> aws_config::SdkConfig {
    aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await
}

pub async fn build_gateway(config: &GatewayBackendConfig) -> GatewayResult<Arc<dyn Gateway>> {
    let gateway: Arc<dyn Gateway> = match config {
        GatewayBackendConfig::Local(local) => {
            info!(program = ?local.program, "using local gateway");
            Arc::new(LocalGateway::new(Arc::new(ProcessSpawner::new(local.clone()))))
        }
        GatewayBackendConfig::Ecs(ecs) => {
            info!(cluster = %ecs.cluster, region = %ecs.region, "using ecs gateway");
            Arc::new(EcsGateway::new(&sdk_config().await, ecs.clone()))
        }
        GatewayBackendConfig::Kubernetes(k8s) => {
            info!(namespace = %k8s.namespace, "using kubernetes gateway");
            Arc::new(KubernetesGateway::new(KubeClient::from_config(k8s)?, k8s.clone()))
        }
    };
    Ok(gateway)
}

/// `None` when no importer is configured; imports are then run by hand.
pub async fn build_importer(
    config: Option<&ImporterConfig>,
) -> GatewayResult<Option<Arc<dyn Importer>>> {
    let importer: Arc<dyn Importer> = match config {
        None => return Ok(None),
        Some(ImporterConfig::Fargate(fargate)) => {
            Arc::new(FargateImporter::new(&sdk_config().await, fargate.clone()))
        }
        Some(ImporterConfig::Kubernetes(k8s)) => Arc::new(KubernetesImporter::new(
            KubeClient::from_config(k8s)?,
            k8s.clone(),
        )),
    };
    Ok(Some(importer))
}
