//! Rollout orchestration.
//!
//! - [`DeploymentAction`]: one service, one task definition change, poll to completion
//! - [`Deployer`]: deploy and revert flows built on an action
//! - [`DeploymentCoordinator`]: bounded-concurrency fan-out across services

mod action;
mod coordinator;
mod deployer;

pub use action::{DeploymentAction, DeploymentState, PollSettings, RunTaskAction};
pub use coordinator::{DeploymentCoordinator, DeploymentOutcome, DeploymentRecord, Job};
pub use deployer::{print_task_diff, Deployer, NewVersion, ServiceIdentity};
