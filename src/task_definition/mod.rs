//! Point-in-time view of an ECS task definition.
//!
//! A snapshot is either read back from `DescribeTaskDefinition` or built fresh
//! from service configuration. Mutating operations (`set_images`,
//! `apply_container_environment_and_secrets`, `set_role_arn`, `set_commands`)
//! change the snapshot in place and append to an ordered diff log, which is
//! what gets shown to the operator before anything is registered.
//!
//! Snapshots are never re-registered in place: registration always creates a
//! new revision, tagged with the ARN of the snapshot it was built from.

mod diff;

pub use diff::{DiffField, DiffValue, TaskDefinitionDiff};

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::error::{DeployError, Result};

/// Tag pointing at the revision a task definition was derived from.
pub const PREVIOUS_TASK_DEFINITION_TAG: &str = "previous_task_definition_arn";
/// Tag holding the operator-supplied deployment identifier.
pub const DEPLOYMENT_IDENTIFIER_TAG: &str = "deployment_identifier";
/// Launch-type compatibility that requires task-level cpu/memory.
pub const FARGATE: &str = "FARGATE";

/// Plain environment variable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValuePair {
    pub name: String,
    pub value: String,
}

/// Secret reference resolved by ECS at task start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretRef {
    pub name: String,
    pub value_from: String,
}

/// The parts of a container definition this tool reads or rewrites.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerDefinition {
    pub name: String,
    pub image: String,
    pub essential: bool,
    pub command: Vec<String>,
    pub environment: Vec<KeyValuePair>,
    pub secrets: Vec<SecretRef>,
}

impl ContainerDefinition {
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            ..Default::default()
        }
    }

    pub fn essential(mut self, essential: bool) -> Self {
        self.essential = essential;
        self
    }

    pub fn with_environment(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.push(KeyValuePair {
            name: name.into(),
            value: value.into(),
        });
        self
    }

    pub fn with_secret(mut self, name: impl Into<String>, value_from: impl Into<String>) -> Self {
        self.secrets.push(SecretRef {
            name: name.into(),
            value_from: value_from.into(),
        });
        self
    }

    /// Environment as a name -> value map.
    pub fn environment_map(&self) -> BTreeMap<String, String> {
        self.environment
            .iter()
            .map(|e| (e.name.clone(), e.value.clone()))
            .collect()
    }

    /// Secrets as a name -> valueFrom map.
    pub fn secrets_map(&self) -> BTreeMap<String, String> {
        self.secrets
            .iter()
            .map(|s| (s.name.clone(), s.value_from.clone()))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Volume {
    pub name: String,
    pub host_path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlacementConstraint {
    pub constraint_type: String,
    pub expression: Option<String>,
}

/// Desired environment and secrets for one container.
///
/// Applied as a full replacement: keys absent here are removed from the
/// container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerConfig {
    pub environment: BTreeMap<String, String>,
    pub secrets: BTreeMap<String, String>,
}

/// How `set_images` picks the new image for each target container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageUpdate {
    /// Keep each container's repository and swap in a new tag.
    Tag {
        containers: Vec<String>,
        tag: String,
    },
    /// Explicit container name -> image URI.
    Explicit(BTreeMap<String, String>),
}

impl ImageUpdate {
    pub fn tag(container: impl Into<String>, tag: impl Into<String>) -> Self {
        ImageUpdate::Tag {
            containers: vec![container.into()],
            tag: tag.into(),
        }
    }

    pub fn explicit(container: impl Into<String>, image: impl Into<String>) -> Self {
        ImageUpdate::Explicit(BTreeMap::from([(container.into(), image.into())]))
    }

    fn targets(&self) -> Vec<&str> {
        match self {
            ImageUpdate::Tag { containers, .. } => containers.iter().map(String::as_str).collect(),
            ImageUpdate::Explicit(images) => images.keys().map(String::as_str).collect(),
        }
    }
}

/// Override for a one-off `RunTask`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerOverride {
    pub name: String,
    pub command: Option<Vec<String>>,
    pub environment: Option<Vec<KeyValuePair>>,
}

/// One ECS task definition revision plus the diff log of local edits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskDefinitionSnapshot {
    family: String,
    revision: i32,
    arn: Option<String>,
    containers: Vec<ContainerDefinition>,
    volumes: Vec<Volume>,
    task_role_arn: Option<String>,
    execution_role_arn: Option<String>,
    network_mode: Option<String>,
    requires_compatibilities: Vec<String>,
    cpu: Option<String>,
    memory: Option<String>,
    placement_constraints: Vec<PlacementConstraint>,
    tags: BTreeMap<String, String>,
    diff: Vec<TaskDefinitionDiff>,
}

impl TaskDefinitionSnapshot {
    /// Create a snapshot, rejecting duplicate container names.
    pub fn new(family: impl Into<String>, containers: Vec<ContainerDefinition>) -> Result<Self> {
        let mut seen = BTreeSet::new();
        for container in &containers {
            if !seen.insert(container.name.as_str()) {
                return Err(DeployError::unrecoverable(format!(
                    "duplicate container name in task definition: {}",
                    container.name
                )));
            }
        }

        Ok(Self {
            family: family.into(),
            revision: 0,
            arn: None,
            containers,
            volumes: Vec::new(),
            task_role_arn: None,
            execution_role_arn: None,
            network_mode: None,
            requires_compatibilities: Vec::new(),
            cpu: None,
            memory: None,
            placement_constraints: Vec::new(),
            tags: BTreeMap::new(),
            diff: Vec::new(),
        })
    }

    pub fn with_arn(mut self, arn: impl Into<String>, revision: i32) -> Self {
        self.arn = Some(arn.into());
        self.revision = revision;
        self
    }

    pub fn with_volumes(mut self, volumes: Vec<Volume>) -> Self {
        self.volumes = volumes;
        self
    }

    pub fn with_roles(mut self, task_role_arn: Option<String>, execution_role_arn: Option<String>) -> Self {
        self.task_role_arn = task_role_arn;
        self.execution_role_arn = execution_role_arn;
        self
    }

    pub fn with_network_mode(mut self, network_mode: Option<String>) -> Self {
        self.network_mode = network_mode;
        self
    }

    pub fn with_compatibilities(mut self, requires_compatibilities: Vec<String>) -> Self {
        self.requires_compatibilities = requires_compatibilities;
        self
    }

    pub fn with_task_size(mut self, cpu: Option<String>, memory: Option<String>) -> Self {
        self.cpu = cpu;
        self.memory = memory;
        self
    }

    pub fn with_placement_constraints(mut self, constraints: Vec<PlacementConstraint>) -> Self {
        self.placement_constraints = constraints;
        self
    }

    pub fn with_tags(mut self, tags: BTreeMap<String, String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn family(&self) -> &str {
        &self.family
    }

    pub fn revision(&self) -> i32 {
        self.revision
    }

    pub fn arn(&self) -> Option<&str> {
        self.arn.as_deref()
    }

    /// `family:revision`, as accepted by `RunTask`.
    pub fn family_revision(&self) -> String {
        format!("{}:{}", self.family, self.revision)
    }

    pub fn containers(&self) -> &[ContainerDefinition] {
        &self.containers
    }

    pub fn container_names(&self) -> BTreeSet<String> {
        self.containers.iter().map(|c| c.name.clone()).collect()
    }

    pub fn container(&self, name: &str) -> Option<&ContainerDefinition> {
        self.containers.iter().find(|c| c.name == name)
    }

    pub fn volumes(&self) -> &[Volume] {
        &self.volumes
    }

    pub fn task_role_arn(&self) -> Option<&str> {
        self.task_role_arn.as_deref()
    }

    pub fn execution_role_arn(&self) -> Option<&str> {
        self.execution_role_arn.as_deref()
    }

    pub fn network_mode(&self) -> Option<&str> {
        self.network_mode.as_deref()
    }

    pub fn requires_compatibilities(&self) -> &[String] {
        &self.requires_compatibilities
    }

    pub fn is_fargate(&self) -> bool {
        self.requires_compatibilities.iter().any(|c| c == FARGATE)
    }

    pub fn cpu(&self) -> Option<&str> {
        self.cpu.as_deref()
    }

    pub fn memory(&self) -> Option<&str> {
        self.memory.as_deref()
    }

    pub fn placement_constraints(&self) -> &[PlacementConstraint] {
        &self.placement_constraints
    }

    pub fn tags(&self) -> &BTreeMap<String, String> {
        &self.tags
    }

    /// ARN this revision was derived from; `None` on a first-ever deployment.
    pub fn previous_task_definition_arn(&self) -> Option<&str> {
        self.tags.get(PREVIOUS_TASK_DEFINITION_TAG).map(String::as_str)
    }

    pub fn deployment_identifier(&self) -> Option<&str> {
        self.tags.get(DEPLOYMENT_IDENTIFIER_TAG).map(String::as_str)
    }

    /// Name of the first container marked essential.
    pub fn essential_container(&self) -> Result<&str> {
        self.containers
            .iter()
            .find(|c| c.essential)
            .map(|c| c.name.as_str())
            .ok_or_else(|| DeployError::unrecoverable("no essential containers found"))
    }

    /// Every diff recorded so far, in call order.
    pub fn diff(&self) -> &[TaskDefinitionDiff] {
        &self.diff
    }

    /// Tags for a revision registered from this snapshot.
    pub fn registration_tags(&self, deployment_identifier: Option<&str>) -> BTreeMap<String, String> {
        let mut tags = BTreeMap::new();
        if let Some(arn) = &self.arn {
            tags.insert(PREVIOUS_TASK_DEFINITION_TAG.to_string(), arn.clone());
        }
        if let Some(id) = deployment_identifier {
            tags.insert(DEPLOYMENT_IDENTIFIER_TAG.to_string(), id.to_string());
        }
        tags
    }

    // ------------------------------------------------------------------
    // Mutations
    // ------------------------------------------------------------------

    /// Point the target containers at new images.
    ///
    /// Fails with `UnknownContainer` before touching anything if a target is
    /// missing. Records one `image` diff per container whose image changes.
    pub fn set_images(&mut self, update: &ImageUpdate) -> Result<()> {
        self.validate_container_names(update.targets())?;

        for container in &mut self.containers {
            let new_image = match update {
                ImageUpdate::Explicit(images) => match images.get(&container.name) {
                    Some(image) => image.clone(),
                    None => continue,
                },
                ImageUpdate::Tag { containers, tag } => {
                    if !containers.contains(&container.name) {
                        continue;
                    }
                    retag_image(&container.image, tag)
                }
            };

            if new_image == container.image {
                continue;
            }

            self.diff.push(TaskDefinitionDiff::new(
                Some(container.name.clone()),
                DiffField::Image,
                DiffValue::text(new_image.clone()),
                DiffValue::text(container.image.clone()),
            ));
            container.image = new_image;
        }

        Ok(())
    }

    /// Replace the command of each named container.
    pub fn set_commands(&mut self, commands: &BTreeMap<String, String>) -> Result<()> {
        self.validate_container_names(commands.keys().map(String::as_str))?;

        for container in &mut self.containers {
            let Some(command) = commands.get(&container.name) else {
                continue;
            };
            let old = if container.command.is_empty() {
                DiffValue::Text(None)
            } else {
                DiffValue::text(container.command.join(" "))
            };
            self.diff.push(TaskDefinitionDiff::new(
                Some(container.name.clone()),
                DiffField::Command,
                DiffValue::text(command.clone()),
                old,
            ));
            container.command = command.split_whitespace().map(str::to_string).collect();
        }

        Ok(())
    }

    /// Replace a container's environment and secrets wholesale.
    ///
    /// Always records an `environment` diff followed by a `secrets` diff, even
    /// when nothing changed.
    pub fn apply_container_environment_and_secrets(
        &mut self,
        container_name: &str,
        config: &ContainerConfig,
    ) -> Result<()> {
        let container = self
            .containers
            .iter_mut()
            .find(|c| c.name == container_name)
            .ok_or_else(|| DeployError::UnknownContainer(container_name.to_string()))?;

        let old_environment = container.environment_map();
        container.environment = config
            .environment
            .iter()
            .map(|(name, value)| KeyValuePair {
                name: name.clone(),
                value: value.clone(),
            })
            .collect();

        let old_secrets = container.secrets_map();
        container.secrets = config
            .secrets
            .iter()
            .map(|(name, value_from)| SecretRef {
                name: name.clone(),
                value_from: value_from.clone(),
            })
            .collect();

        self.diff.push(TaskDefinitionDiff::new(
            Some(container_name.to_string()),
            DiffField::Environment,
            DiffValue::Map(config.environment.clone()),
            DiffValue::Map(old_environment),
        ));
        self.diff.push(TaskDefinitionDiff::new(
            Some(container_name.to_string()),
            DiffField::Secrets,
            DiffValue::Map(config.secrets.clone()),
            DiffValue::Map(old_secrets),
        ));

        Ok(())
    }

    /// Set the task role. `None` leaves the snapshot untouched.
    pub fn set_role_arn(&mut self, role_arn: Option<&str>) {
        let Some(role_arn) = role_arn else {
            return;
        };
        self.diff.push(TaskDefinitionDiff::new(
            None,
            DiffField::RoleArn,
            DiffValue::text(role_arn),
            DiffValue::Text(self.task_role_arn.clone()),
        ));
        self.task_role_arn = Some(role_arn.to_string());
    }

    /// Container overrides for a one-off task, derived from the diff log.
    ///
    /// Consecutive diffs for the same container collapse into one override.
    /// Task-level diffs have no container and are skipped.
    pub fn get_overrides(&self) -> Vec<ContainerOverride> {
        let mut overrides: Vec<ContainerOverride> = Vec::new();

        for diff in &self.diff {
            let Some(container) = diff.container() else {
                continue;
            };
            let starts_new = overrides.last().map_or(true, |o| o.name != container);
            if starts_new {
                overrides.push(ContainerOverride {
                    name: container.to_string(),
                    ..Default::default()
                });
            }
            let Some(current) = overrides.last_mut() else {
                continue;
            };

            match (diff.field(), diff.value()) {
                (DiffField::Command, DiffValue::Text(Some(command))) => {
                    current.command = Some(command.split(' ').map(str::to_string).collect());
                }
                (DiffField::Environment, DiffValue::Map(env)) => {
                    current.environment = Some(
                        env.iter()
                            .map(|(name, value)| KeyValuePair {
                                name: name.clone(),
                                value: value.clone(),
                            })
                            .collect(),
                    );
                }
                _ => {}
            }
        }

        overrides
    }

    fn validate_container_names<'a>(&self, names: impl IntoIterator<Item = &'a str>) -> Result<()> {
        for name in names {
            if self.container(name).is_none() {
                return Err(DeployError::UnknownContainer(name.to_string()));
            }
        }
        Ok(())
    }
}

/// Swap the tag of an image reference, splitting on the last `:`.
///
/// A colon that belongs to a registry port (`host:5000/repo`) is not a tag
/// separator, so such references get the tag appended instead.
fn retag_image(image: &str, tag: &str) -> String {
    let tag = tag.trim();
    match image.rsplit_once(':') {
        Some((repository, current)) if !current.contains('/') => format!("{}:{}", repository, tag),
        _ => format!("{}:{}", image, tag),
    }
}

#[cfg(test)]
mod tests;
