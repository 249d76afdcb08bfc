//! Fargate importer: one ECS task per import, environment passed as a
//! container override.

use std::collections::BTreeMap;

use async_trait::async_trait;
use aws_sdk_ecs::Client;
use aws_sdk_ecs::types::{
    AssignPublicIp, AwsVpcConfiguration, ContainerOverride, LaunchType, NetworkConfiguration,
    TaskOverride,
};
use depot_core::FargateImporterConfig;
use tracing::{info, warn};

use crate::ecs::{ecs_client, key_value_pairs, sdk_err};
use crate::error::{GatewayError, GatewayResult};
use crate::traits::Importer;

pub struct FargateImporter {
    client: Client,
    config: FargateImporterConfig,
}

impl FargateImporter {
    pub fn new(sdk_config: &aws_config::SdkConfig, config: FargateImporterConfig) -> Self {
        let client = ecs_client(sdk_config, &config.region, config.endpoint.as_deref(), 60_000);
        info!(cluster = %config.cluster, "using fargate importer");
        Self { client, config }
    }

    fn network(&self) -> GatewayResult<NetworkConfiguration> {
        let assign_public_ip = if self.config.assign_public_ip {
            AssignPublicIp::Enabled
        } else {
            AssignPublicIp::Disabled
        };
        let vpc = AwsVpcConfiguration::builder()
            .set_subnets(Some(self.config.subnets.clone()))
            .set_security_groups(Some(self.config.security_groups.clone()))
            .assign_public_ip(assign_public_ip)
            .build()
            .map_err(|e| GatewayError::backend(e.to_string()))?;
        Ok(NetworkConfiguration::builder()
            .awsvpc_configuration(vpc)
            .build())
    }
}

#[async_trait]
impl Importer for FargateImporter {
    async fn start_task(&self, env: BTreeMap<String, String>) -> GatewayResult<()> {
        let prefix = env.get("PREFIX").ok_or(GatewayError::MissingEnv("PREFIX"))?;
        let version = env.get("VERSION").ok_or(GatewayError::MissingEnv("VERSION"))?;
        info!(%prefix, %version, "starting fargate import task");

        let overrides = TaskOverride::builder()
            .container_overrides(
                ContainerOverride::builder()
                    .name(&self.config.container_name)
                    .set_environment(Some(key_value_pairs(&env)))
                    .build(),
            )
            .build();

        let output = self
            .client
            .run_task()
            .cluster(&self.config.cluster)
            .task_definition(&self.config.task_definition)
            .launch_type(LaunchType::Fargate)
            .network_configuration(self.network()?)
            .overrides(overrides)
            .send()
            .await
            .map_err(sdk_err)?;

        for failure in output.failures() {
            warn!(
                %prefix,
                %version,
                reason = failure.reason().unwrap_or_default(),
                "fargate task failure"
            );
        }
        if output.tasks().is_empty() {
            return Err(GatewayError::backend(format!("no import task started for {prefix}")));
        }
        info!(%prefix, %version, "fargate import task started");
        Ok(())
    }
}
