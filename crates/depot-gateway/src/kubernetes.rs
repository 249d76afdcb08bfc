//! Kubernetes batch jobs, used both as importer and as worker gateway.
//!
//! Talks to the API server over plain HTTPS with the pod's service account
//! token. Jobs are named deterministically from the region prefix and the
//! version label, so resubmitting an import is a 409 that is logged and
//! otherwise ignored.

use std::collections::BTreeMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use depot_core::{EnvMode, GatewayConfig, KubernetesJobConfig, to_environment};
use reqwest::StatusCode;
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use tracing::{debug, error, info, warn};

use crate::error::{GatewayError, GatewayResult};
use crate::traits::{Gateway, Importer};

/// Credentials injected into every job from the configured secret.
const SECRET_KEYS: [&str; 2] = ["AWS_ACCESS_KEY_ID", "AWS_SECRET_ACCESS_KEY"];

const LABEL_PREFIX: &str = "depot.io/prefix";
const LABEL_VERSION: &str = "depot.io/version";
const LABEL_ROLE: &str = "depot.io/role";

/// DNS-1123 label limit.
const MAX_NAME_LEN: usize = 63;

/// Hex digits of the disambiguating suffix on rewritten job names.
const NAME_HASH_LEN: usize = 8;

/// Outcome of a job submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobSubmission {
    Created,
    AlreadyExists,
}

/// Minimal batch/v1 client for one namespace.
#[derive(Clone)]
pub struct KubeClient {
    http: reqwest::Client,
    api_server: String,
    namespace: String,
    token: Option<String>,
}

impl KubeClient {
    /// Build an in-cluster client. A missing token file means anonymous
    /// access, which is what local clusters behind `kubectl proxy` expect.
    pub fn from_config(config: &KubernetesJobConfig) -> GatewayResult<Self> {
        let token = match std::fs::read_to_string(&config.token_path) {
            Ok(token) => Some(token.trim().to_string()),
            Err(e) => {
                debug!(path = ?config.token_path, error = %e, "no service account token");
                None
            }
        };

        let mut builder =
            reqwest::Client::builder().timeout(Duration::from_millis(config.timeout_ms));
        if let Some(dir) = config.token_path.parent() {
            if let Ok(pem) = std::fs::read(dir.join("ca.crt")) {
                builder = builder.add_root_certificate(reqwest::Certificate::from_pem(&pem)?);
            }
        }

        Ok(Self::new(
            builder.build()?,
            &config.api_server,
            &config.namespace,
            token,
        ))
    }

    pub fn new(http: reqwest::Client, api_server: &str, namespace: &str, token: Option<String>) -> Self {
        Self {
            http,
            api_server: api_server.trim_end_matches('/').to_string(),
            namespace: namespace.to_string(),
            token,
        }
    }

    fn jobs_url(&self) -> String {
        format!(
            "{}/apis/batch/v1/namespaces/{}/jobs",
            self.api_server, self.namespace
        )
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    pub async fn create_job(&self, manifest: &Value) -> GatewayResult<JobSubmission> {
        let response = self
            .authorize(self.http.post(self.jobs_url()))
            .json(manifest)
            .send()
            .await?;

        match response.status() {
            status if status.is_success() => Ok(JobSubmission::Created),
            StatusCode::CONFLICT => Ok(JobSubmission::AlreadyExists),
            status => Err(GatewayError::Kubernetes {
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            }),
        }
    }

    /// Delete every job matching `selector`, pods included.
    pub async fn delete_jobs(&self, selector: &str) -> GatewayResult<()> {
        let response = self
            .authorize(self.http.delete(self.jobs_url()))
            .query(&[
                ("labelSelector", selector),
                ("propagationPolicy", "Background"),
            ])
            .send()
            .await?;

        let status = response.status();
        if status.is_success() || status == StatusCode::NOT_FOUND {
            return Ok(());
        }
        Err(GatewayError::Kubernetes {
            status: status.as_u16(),
            body: response.text().await.unwrap_or_default(),
        })
    }
}

/// `{job_prefix}-{prefix}-{version}`, lower-cased, with anything outside
/// `[a-z0-9-]` replaced by `-` and capped at 63 characters.
///
/// When that rewrite changes the name, a short digest of the exact prefix
/// and version is appended so distinct versions never share a job name.
pub fn job_name(job_prefix: &str, prefix: &str, version: &str) -> String {
    let raw = format!("{job_prefix}-{prefix}-{version}");
    let mut name: String = raw
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_lowercase() || c.is_ascii_digit() { c } else { '-' })
        .collect();
    if name == raw && name.len() <= MAX_NAME_LEN && !name.ends_with('-') {
        return name;
    }

    let digest = Sha256::new()
        .chain_update(prefix.as_bytes())
        .chain_update([0u8])
        .chain_update(version.as_bytes())
        .finalize();
    let suffix = &hex::encode(digest)[..NAME_HASH_LEN];
    name.truncate(MAX_NAME_LEN - NAME_HASH_LEN - 1);
    format!("{}-{suffix}", name.trim_end_matches('-'))
}

/// Label values allow `[A-Za-z0-9_.-]`.
fn label_value(value: &str) -> String {
    let mut label: String = value
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') { c } else { '_' })
        .collect();
    label.truncate(MAX_NAME_LEN);
    label
}

/// batch/v1 Job running `image` once with `env` plus secret-backed
/// credentials.
pub fn job_manifest(
    name: &str,
    image: &str,
    secret: &str,
    env: &BTreeMap<String, String>,
    labels: &BTreeMap<&str, String>,
    restart_policy: &str,
) -> Value {
    let mut container_env: Vec<Value> = env
        .iter()
        .map(|(name, value)| json!({ "name": name, "value": value }))
        .collect();
    for key in SECRET_KEYS {
        container_env.push(json!({
            "name": key,
            "valueFrom": { "secretKeyRef": { "name": secret, "key": key } },
        }));
    }

    json!({
        "apiVersion": "batch/v1",
        "kind": "Job",
        "metadata": { "name": name, "labels": labels },
        "spec": {
            "template": {
                "metadata": { "labels": labels },
                "spec": {
                    "containers": [{
                        "name": "depot",
                        "image": image,
                        "env": container_env,
                    }],
                    "restartPolicy": restart_policy,
                },
            },
        },
    })
}

// ── Importer ───────────────────────────────────────────────────

pub struct KubernetesImporter {
    client: KubeClient,
    config: KubernetesJobConfig,
}

impl KubernetesImporter {
    pub fn new(client: KubeClient, config: KubernetesJobConfig) -> Self {
        info!(namespace = %config.namespace, "using kubernetes importer");
        Self { client, config }
    }
}

#[async_trait]
impl Importer for KubernetesImporter {
    async fn start_task(&self, env: BTreeMap<String, String>) -> GatewayResult<()> {
        let prefix = env.get("PREFIX").ok_or(GatewayError::MissingEnv("PREFIX"))?;
        let version = env.get("VERSION").ok_or(GatewayError::MissingEnv("VERSION"))?;
        let name = job_name(&self.config.job_prefix, prefix, version);
        let labels = BTreeMap::from([
            (LABEL_PREFIX, label_value(prefix)),
            (LABEL_VERSION, label_value(version)),
            (LABEL_ROLE, "importer".to_string()),
        ]);
        let manifest = job_manifest(
            &name,
            &self.config.image,
            &self.config.secret,
            &env,
            &labels,
            "Never",
        );

        info!(%prefix, %version, job = %name, "starting kubernetes job");
        match self.client.create_job(&manifest).await {
            Ok(JobSubmission::Created) => {
                info!(%prefix, %version, job = %name, namespace = %self.config.namespace, "job created");
                Ok(())
            }
            Ok(JobSubmission::AlreadyExists) => {
                warn!(%prefix, %version, job = %name, "job already exists");
                Ok(())
            }
            Err(e) => {
                error!(%prefix, %version, job = %name, error = %e, "could not create job");
                Err(e)
            }
        }
    }
}

// ── Gateway ────────────────────────────────────────────────────

/// Runs each region's worker as a job labelled with its prefix.
///
/// `start` removes worker jobs of other versions for the prefix before
/// submitting; `recycle` removes all of them and submits under a fresh
/// generation suffix so the new job never collides with the one still
/// terminating.
pub struct KubernetesGateway {
    client: KubeClient,
    config: KubernetesJobConfig,
}

impl KubernetesGateway {
    pub fn new(client: KubeClient, config: KubernetesJobConfig) -> Self {
        Self { client, config }
    }

    fn worker_labels(prefix: &str, config: &GatewayConfig) -> BTreeMap<&'static str, String> {
        BTreeMap::from([
            (LABEL_PREFIX, label_value(prefix)),
            (LABEL_VERSION, label_value(&config.id)),
            (LABEL_ROLE, "worker".to_string()),
        ])
    }

    fn prefix_selector(prefix: &str) -> String {
        format!("{LABEL_PREFIX}={},{LABEL_ROLE}=worker", label_value(prefix))
    }

    async fn submit(&self, prefix: &str, name: &str, config: &GatewayConfig) -> GatewayResult<()> {
        let env = to_environment(config, EnvMode::Worker);
        let manifest = job_manifest(
            name,
            &self.config.image,
            &self.config.secret,
            &env,
            &Self::worker_labels(prefix, config),
            "OnFailure",
        );
        match self.client.create_job(&manifest).await? {
            JobSubmission::Created => info!(prefix, job = %name, "worker job created"),
            JobSubmission::AlreadyExists => warn!(prefix, job = %name, "worker job already exists"),
        }
        Ok(())
    }
}

#[async_trait]
impl Gateway for KubernetesGateway {
    async fn start(&self, prefix: &str, config: &GatewayConfig) -> GatewayResult<()> {
        let selector = format!(
            "{},{LABEL_VERSION}!={}",
            Self::prefix_selector(prefix),
            label_value(&config.id)
        );
        self.client.delete_jobs(&selector).await?;

        let name = job_name(&self.config.job_prefix, prefix, &config.version);
        self.submit(prefix, &name, config).await
    }

    async fn recycle(&self, prefix: &str, config: &GatewayConfig) -> GatewayResult<()> {
        self.client.delete_jobs(&Self::prefix_selector(prefix)).await?;

        let generation = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let name = job_name(
            &self.config.job_prefix,
            prefix,
            &format!("{}-{generation}", config.version),
        );
        self.submit(prefix, &name, config).await
    }

    async fn stop(&self, prefix: &str) -> GatewayResult<()> {
        self.client.delete_jobs(&Self::prefix_selector(prefix)).await?;
        info!(prefix, "worker jobs deleted");
        Ok(())
    }
}
