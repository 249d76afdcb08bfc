//! ECS gateway: one long-running service per region prefix.
//!
//! `start` converges the service onto the worker environment: if the
//! environment of the deployed task definition differs, a new revision is
//! registered from the old one with only the environment replaced; the
//! service is then updated when its task definition or desired count
//! drifted. Failures in `start` are logged and swallowed so a bad region
//! never blocks the sweep; the next actuation retries.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_ecs::Client;
use aws_sdk_ecs::error::DisplayErrorContext;
use aws_sdk_ecs::types::{KeyValuePair, TaskDefinition};
use aws_smithy_types::timeout::TimeoutConfig;
use depot_core::{EcsGatewayConfig, EnvMode, GatewayConfig, to_environment};
use tracing::{debug, error, info};

use crate::error::{GatewayError, GatewayResult};
use crate::traits::Gateway;

pub(crate) fn sdk_err<E>(e: E) -> GatewayError
where
    E: std::error::Error + 'static,
{
    GatewayError::Backend(DisplayErrorContext(e).to_string())
}

pub(crate) fn ecs_client(
    sdk_config: &aws_config::SdkConfig,
    region: &str,
    endpoint: Option<&str>,
    timeout_ms: u64,
) -> Client {
    let mut builder = aws_sdk_ecs::config::Builder::from(sdk_config)
        .region(aws_sdk_ecs::config::Region::new(region.to_string()))
        .timeout_config(
            TimeoutConfig::builder()
                .operation_timeout(Duration::from_millis(timeout_ms))
                .build(),
        );
    if let Some(endpoint) = endpoint {
        builder = builder.endpoint_url(endpoint);
    }
    Client::from_conf(builder.build())
}

pub struct EcsGateway {
    client: Client,
    config: EcsGatewayConfig,
}

impl EcsGateway {
    pub fn new(sdk_config: &aws_config::SdkConfig, config: EcsGatewayConfig) -> Self {
        let client = ecs_client(
            sdk_config,
            &config.region,
            config.endpoint.as_deref(),
            config.timeout_ms,
        );
        Self::from_client(client, config)
    }

    pub fn from_client(client: Client, config: EcsGatewayConfig) -> Self {
        Self { client, config }
    }

    async fn converge(&self, prefix: &str, service_name: &str, env: &BTreeMap<String, String>) -> GatewayResult<()> {
        let described = self
            .client
            .describe_services()
            .cluster(&self.config.cluster)
            .services(service_name)
            .send()
            .await
            .map_err(sdk_err)?;
        let service = described
            .services()
            .first()
            .ok_or_else(|| GatewayError::ServiceNotFound(service_name.to_string()))?;
        let deployed_arn = service
            .task_definition()
            .ok_or_else(|| GatewayError::backend(format!("{service_name} has no task definition")))?;

        // Describe the latest revision of the family, not the deployed one.
        let latest = self
            .client
            .describe_task_definition()
            .task_definition(family_of(deployed_arn))
            .send()
            .await
            .map_err(sdk_err)?;
        let task_definition = latest
            .task_definition()
            .ok_or_else(|| GatewayError::backend(format!("{deployed_arn} not found")))?;
        let container = task_definition
            .container_definitions()
            .first()
            .ok_or_else(|| GatewayError::backend(format!("{deployed_arn} has no containers")))?;

        let desired_env = key_value_pairs(env);
        let mut target_arn = task_definition
            .task_definition_arn()
            .unwrap_or_default()
            .to_string();

        if env_fingerprint(container.environment()) == env_fingerprint(&desired_env) {
            info!(prefix, "environment unchanged");
        } else {
            info!(prefix, "environment changed, registering task definition");
            target_arn = self.register_revision(task_definition, desired_env).await?;
            info!(prefix, arn = %target_arn, "task definition registered");
        }

        let replicas = self.config.replicas;
        if needs_update(deployed_arn, service.desired_count(), &target_arn, replicas) {
            info!(
                prefix,
                wanted_replicas = replicas,
                actual_replicas = service.desired_count(),
                "updating service"
            );
            self.client
                .update_service()
                .cluster(&self.config.cluster)
                .service(service_name)
                .task_definition(&target_arn)
                .desired_count(replicas)
                .send()
                .await
                .map_err(sdk_err)?;
            info!(prefix, service = service_name, "ecs service updated");
        } else {
            info!(prefix, service = service_name, "no updates required");
        }
        Ok(())
    }

    /// Register a copy of `old` with the first container's environment
    /// replaced. Identity, revision and status fields are not carried over.
    async fn register_revision(
        &self,
        old: &TaskDefinition,
        environment: Vec<KeyValuePair>,
    ) -> GatewayResult<String> {
        let mut containers = old.container_definitions().to_vec();
        if let Some(first) = containers.first_mut() {
            first.environment = Some(environment);
        }

        let registered = self
            .client
            .register_task_definition()
            .set_family(old.family().map(str::to_string))
            .set_task_role_arn(old.task_role_arn().map(str::to_string))
            .set_execution_role_arn(old.execution_role_arn().map(str::to_string))
            .set_network_mode(old.network_mode().cloned())
            .set_container_definitions(Some(containers))
            .set_volumes(Some(old.volumes().to_vec()))
            .set_placement_constraints(Some(old.placement_constraints().to_vec()))
            .set_requires_compatibilities(Some(old.requires_compatibilities().to_vec()))
            .set_cpu(old.cpu().map(str::to_string))
            .set_memory(old.memory().map(str::to_string))
            .set_pid_mode(old.pid_mode().cloned())
            .set_ipc_mode(old.ipc_mode().cloned())
            .set_proxy_configuration(old.proxy_configuration().cloned())
            .set_ephemeral_storage(old.ephemeral_storage().cloned())
            .set_runtime_platform(old.runtime_platform().cloned())
            .send()
            .await
            .map_err(sdk_err)?;

        registered
            .task_definition()
            .and_then(|td| td.task_definition_arn())
            .map(str::to_string)
            .ok_or_else(|| GatewayError::backend("registered task definition has no arn"))
    }
}

#[async_trait]
impl Gateway for EcsGateway {
    async fn start(&self, prefix: &str, config: &GatewayConfig) -> GatewayResult<()> {
        let service_name = self.config.service_name(prefix);
        let env = to_environment(config, EnvMode::Worker);
        info!(prefix, service = %service_name, "starting ecs service");
        debug!(prefix, vars = env.len(), "worker environment");

        if let Err(e) = self.converge(prefix, &service_name, &env).await {
            error!(prefix, service = %service_name, error = %e, "could not start ecs service");
        }
        Ok(())
    }

    async fn recycle(&self, prefix: &str, _config: &GatewayConfig) -> GatewayResult<()> {
        let service_name = self.config.service_name(prefix);
        self.client
            .update_service()
            .cluster(&self.config.cluster)
            .service(&service_name)
            .force_new_deployment(true)
            .desired_count(self.config.replicas)
            .send()
            .await
            .map_err(sdk_err)?;
        info!(prefix, service = %service_name, "ecs service recycled");
        Ok(())
    }

    async fn stop(&self, prefix: &str) -> GatewayResult<()> {
        let service_name = self.config.service_name(prefix);
        info!(prefix, service = %service_name, "scaling ecs service to 0");
        self.client
            .update_service()
            .cluster(&self.config.cluster)
            .service(&service_name)
            .desired_count(0)
            .send()
            .await
            .map_err(sdk_err)?;
        info!(prefix, service = %service_name, "ecs service stopped");
        Ok(())
    }
}

/// `arn:...:task-definition/worker:7` → `arn:...:task-definition/worker`.
fn family_of(arn: &str) -> &str {
    match arn.rsplit_once(':') {
        Some((family, revision)) if revision.chars().all(|c| c.is_ascii_digit()) => family,
        _ => arn,
    }
}

pub(crate) fn key_value_pairs(env: &BTreeMap<String, String>) -> Vec<KeyValuePair> {
    env.iter()
        .map(|(name, value)| KeyValuePair::builder().name(name).value(value).build())
        .collect()
}

/// Order-insensitive comparison key for container environments.
fn env_fingerprint(pairs: &[KeyValuePair]) -> Vec<String> {
    let mut entries: Vec<String> = pairs
        .iter()
        .map(|p| format!("{}|{}", p.name().unwrap_or_default(), p.value().unwrap_or_default()))
        .collect();
    entries.sort();
    entries
}

fn needs_update(deployed_arn: &str, desired_count: i32, target_arn: &str, replicas: i32) -> bool {
    deployed_arn != target_arn || desired_count != replicas
}
