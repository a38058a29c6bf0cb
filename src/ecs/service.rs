//! Read-only view over one ECS service.
//!
//! Always fetched fresh from the control plane; nothing here is cached between
//! polls.

use chrono::{DateTime, Utc};

/// Deployment status ECS assigns to the rollout in progress.
pub const PRIMARY: &str = "PRIMARY";

/// Marker ECS uses in events it cannot act on ("unable to place a task ...").
const UNABLE_MARKER: &str = "unable";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Deployment {
    pub status: String,
    pub task_definition: Option<String>,
    pub desired_count: i32,
    pub running_count: i32,
    pub pending_count: i32,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Deployment {
    pub fn primary(task_definition: impl Into<String>, desired_count: i32, running_count: i32) -> Self {
        Self {
            status: PRIMARY.to_string(),
            task_definition: Some(task_definition.into()),
            desired_count,
            running_count,
            pending_count: 0,
            created_at: None,
            updated_at: None,
        }
    }

    pub fn is_primary(&self) -> bool {
        self.status == PRIMARY
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceEvent {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub message: String,
}

impl ServiceEvent {
    pub fn new(id: impl Into<String>, created_at: DateTime<Utc>, message: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            created_at,
            message: message.into(),
        }
    }

    /// Message as printed to the operator: parentheses dropped and the
    /// leading `service ` prefix cut off.
    pub fn display_message(&self) -> String {
        self.message
            .replace(['(', ')'], "")
            .chars()
            .skip(8)
            .collect()
    }

    pub fn is_placement_failure(&self) -> bool {
        self.message.contains(UNABLE_MARKER)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EcsService {
    pub cluster: String,
    pub name: String,
    pub task_definition: String,
    pub desired_count: i32,
    pub running_count: i32,
    pub pending_count: i32,
    pub deployments: Vec<Deployment>,
    pub events: Vec<ServiceEvent>,
}

impl EcsService {
    /// Service settled on a single deployment with every desired task running.
    pub fn is_deployed(&self) -> bool {
        self.deployments.len() == 1 && self.desired_count == self.running_count
    }

    pub fn primary_deployment(&self) -> Option<&Deployment> {
        self.deployments.iter().find(|d| d.is_primary())
    }

    /// Events ordered oldest first.
    pub fn sorted_events(&self) -> Vec<ServiceEvent> {
        let mut events = self.events.clone();
        events.sort_by_key(|e| e.created_at);
        events
    }

    /// Events not present in `existing`, oldest first.
    pub fn new_events(&self, existing: &[ServiceEvent]) -> Vec<ServiceEvent> {
        self.sorted_events()
            .into_iter()
            .filter(|e| !existing.iter().any(|seen| seen.id == e.id))
            .collect()
    }

    /// "unable" events raised since the primary deployment started.
    pub fn placement_warnings(&self) -> Vec<&ServiceEvent> {
        let since = self.primary_deployment().and_then(|d| d.created_at);
        self.events
            .iter()
            .filter(|e| e.is_placement_failure())
            .filter(|e| since.map_or(true, |since| e.created_at >= since))
            .collect()
    }
}
