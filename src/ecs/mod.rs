//! ECS control plane: the gateway trait, its AWS and in-memory
//! implementations, and the service view the poll loop reads.

mod aws;
mod gateway;
pub mod mock;
mod service;

pub use aws::AwsEcsGateway;
pub use gateway::{
    EcsGateway, GatewayError, RegisterTaskDefinition, Result, RunTaskRequest, TaskDefinitionPage,
    TaskSummary, UpdateServiceRequest,
};
pub use mock::MockEcsGateway;
pub use service::{Deployment, EcsService, ServiceEvent, PRIMARY};
