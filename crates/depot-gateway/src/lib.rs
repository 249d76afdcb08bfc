//! depot-gateway: actuators for worker lifecycles and dataset imports.
//!
//! A [`Gateway`] runs the worker for a region prefix; an [`Importer`] runs
//! the one-shot job that loads a version into its database. Both receive
//! fully derived configuration and never touch orchestrator state.
//!
//! | Backend | Gateway | Importer |
//! |---|---|---|
//! | local processes | [`LocalGateway`] | none |
//! | ECS | [`EcsGateway`] | [`FargateImporter`] |
//! | Kubernetes | [`KubernetesGateway`] | [`KubernetesImporter`] |

pub mod backend;
pub mod ecs;
pub mod error;
pub mod fargate;
pub mod kubernetes;
pub mod local;
pub mod traits;

pub use backend::{build_gateway, build_importer};
pub use ecs::EcsGateway;
pub use error::{GatewayError, GatewayResult};
pub use fargate::FargateImporter;
pub use kubernetes::{KubeClient, KubernetesGateway, KubernetesImporter};
pub use local::{LocalGateway, LocalWorker, ProcessSpawner, RouteTable, WorkerSpawner};
pub use traits::{Gateway, Importer};
