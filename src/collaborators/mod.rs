//! Services the deployment core calls out to: configuration assembly, the
//! image registry, and service discovery.

mod catalog;
mod container_config;
mod image_registry;

pub use catalog::{
    resolve_services, CloudFormationOutputs, ServiceTarget, StackOutputs,
    ECS_SERVICE_OUTPUT_SUFFIX,
};
pub use container_config::{
    read_sample_keys, ConfigRequest, ContainerConfigSource, ParameterStore,
    ParameterStoreConfigSource, SecretStore, SecretValue, SecretsCache, SecretsManagerStore,
    SsmParameterStore, StaticConfigSource,
};
pub use image_registry::{repository_name, EcrImageRegistry, ImageRegistry, StaticImageRegistry};
