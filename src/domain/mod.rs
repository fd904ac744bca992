//! Domain model: entities, status codepoints and template rendering

mod batch;
mod catalog;
mod deployment;
mod release_app;
mod status;
mod template;

pub use batch::{Batch, BatchAction, BatchSnapshot, NewBatch};
pub use catalog::{
    AppEnvConfig, Application, ArtifactsSpec, Build, BuildStatus, Cluster, DriverStage,
    IncomingBuild, Project, ProjectEnvConfig, Repository, StageSpec,
};
pub use deployment::{Deployment, NewDeployment};
pub use release_app::{ManualAction, NewReleaseApp, ReleaseApp};
pub use status::{ApprovalStatus, BatchStatus, DeployState, Env, ReleaseStatus};
pub use template::RenderContext;
