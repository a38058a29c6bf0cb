//! Cloudlift - ECS deployment orchestration
//!
//! Builds new task definition revisions from the running one, rolls them out
//! to ECS services, and watches each rollout until it settles or times out.

pub mod collaborators;
pub mod config;
pub mod console;
pub mod deployment;
pub mod ecs;
pub mod error;
pub mod task_definition;
pub mod utils;

pub use error::{DeployError, Result};
