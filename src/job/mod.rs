//! Job state machine: steps, sub-statuses, and the flag bracket protocol.
//!
//! This module holds the pure domain types for a job's progression. The
//! persistence of these types (as the `steps` JSON column of `etl_jobs`) lives in
//! [`crate::db::models::job`].

use std::fmt;

use serde::{Deserialize, Serialize};

pub mod watermark;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OverallStatus {
    Ready,
    Running,
    Completed,
    Failed,
}

impl OverallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OverallStatus::Ready => "READY",
            OverallStatus::Running => "RUNNING",
            OverallStatus::Completed => "COMPLETED",
            OverallStatus::Failed => "FAILED",
        }
    }
}

impl fmt::Display for OverallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for OverallStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "READY" => Ok(OverallStatus::Ready),
            "RUNNING" => Ok(OverallStatus::Running),
            "COMPLETED" => Ok(OverallStatus::Completed),
            "FAILED" => Ok(OverallStatus::Failed),
            other => Err(anyhow::anyhow!("Unknown overall_status: {}", other)),
        }
    }
}

/// One of the three worker classes. A step carries one [`SubStatus`] per worker type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerType {
    Extraction,
    Transform,
    Embedding,
}

impl fmt::Display for WorkerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WorkerType::Extraction => "extraction",
            WorkerType::Transform => "transform",
            WorkerType::Embedding => "embedding",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubStatus {
    Idle,
    Running,
    Finished,
    Failed,
}

impl SubStatus {
    /// Whether `next` is a legal successor of `self` per the sub-status state
    /// machine: `idle -> running -> finished`, `idle|running -> failed`.
    pub fn can_transition_to(&self, next: SubStatus) -> bool {
        use SubStatus::*;
        if *self == next {
            return true;
        }
        matches!(
            (self, next),
            (Idle, Running) | (Idle, Finished) | (Running, Finished) | (Idle, Failed) | (Running, Failed)
        )
    }
}

/// A newtype for a step name (e.g. `"issues"`, `"prs"`), kept distinct from an
/// entity type because a step and the entity type it processes coincide in this
/// version of the pipeline but are conceptually different slots.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StepName(pub String);

impl fmt::Display for StepName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for StepName {
    fn from(s: &str) -> Self {
        StepName(s.to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepState {
    pub name: StepName,
    pub order: u32,
    pub display_name: String,
    pub extraction: SubStatus,
    pub transform: SubStatus,
    pub embedding: SubStatus,
}

impl StepState {
    pub fn new(name: StepName, order: u32, display_name: impl Into<String>) -> Self {
        StepState {
            name,
            order,
            display_name: display_name.into(),
            extraction: SubStatus::Idle,
            transform: SubStatus::Idle,
            embedding: SubStatus::Idle,
        }
    }

    pub fn substatus(&self, worker_type: WorkerType) -> SubStatus {
        match worker_type {
            WorkerType::Extraction => self.extraction,
            WorkerType::Transform => self.transform,
            WorkerType::Embedding => self.embedding,
        }
    }

    pub fn set_substatus(&mut self, worker_type: WorkerType, value: SubStatus) {
        match worker_type {
            WorkerType::Extraction => self.extraction = value,
            WorkerType::Transform => self.transform = value,
            WorkerType::Embedding => self.embedding = value,
        }
    }

    pub fn all_finished(&self) -> bool {
        self.extraction == SubStatus::Finished
            && self.transform == SubStatus::Finished
            && self.embedding == SubStatus::Finished
    }

    pub fn any_failed(&self) -> bool {
        self.extraction == SubStatus::Failed
            || self.transform == SubStatus::Failed
            || self.embedding == SubStatus::Failed
    }
}

/// The ordered list of steps for a job. Order is dense `1..N`, enforced by
/// [`StepPlan::new`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StepPlan {
    steps: Vec<StepState>,
}

impl StepPlan {
    pub fn new(steps: Vec<StepState>) -> anyhow::Result<Self> {
        let mut orders: Vec<u32> = steps.iter().map(|s| s.order).collect();
        orders.sort_unstable();
        let dense = orders.iter().enumerate().all(|(i, &o)| o == (i as u32) + 1);
        if !dense {
            anyhow::bail!("step orders must be dense 1..N, got {:?}", orders);
        }
        Ok(StepPlan { steps })
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &StepState> {
        let mut ordered: Vec<&StepState> = self.steps.iter().collect();
        ordered.sort_by_key(|s| s.order);
        ordered.into_iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut StepState> {
        self.steps.sort_by_key(|s| s.order);
        self.steps.iter_mut()
    }

    pub fn first(&self) -> Option<&StepState> {
        self.iter().next()
    }

    pub fn get(&self, name: &StepName) -> Option<&StepState> {
        self.steps.iter().find(|s| &s.name == name)
    }

    pub fn get_mut(&mut self, name: &StepName) -> Option<&mut StepState> {
        self.steps.iter_mut().find(|s| &s.name == name)
    }

    pub fn is_last_step(&self, name: &StepName) -> bool {
        self.steps
            .iter()
            .map(|s| s.order)
            .max()
            .map(|max_order| self.get(name).map(|s| s.order == max_order).unwrap_or(false))
            .unwrap_or(false)
    }

    /// The step that comes immediately after `name`, if any.
    pub fn next_after(&self, name: &StepName) -> Option<&StepState> {
        let current_order = self.get(name)?.order;
        self.steps.iter().find(|s| s.order == current_order + 1)
    }

    pub fn all_steps_embedding_finished(&self) -> bool {
        self.steps.iter().all(|s| s.embedding == SubStatus::Finished)
    }

    pub fn any_failed(&self) -> bool {
        self.steps.iter().any(|s| s.any_failed())
    }
}

/// The flag bracket carried on every queue message: the sole synchronization
/// protocol between worker classes. See Ordering guarantees.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlagBracket {
    pub first_item: bool,
    pub last_item: bool,
    pub last_job_item: bool,
}

impl FlagBracket {
    pub fn single(last_job_item: bool) -> Self {
        FlagBracket {
            first_item: true,
            last_item: true,
            last_job_item,
        }
    }

    pub fn validate(&self, is_last_step: bool) -> anyhow::Result<()> {
        if self.last_job_item && !(self.last_item && is_last_step) {
            anyhow::bail!("last_job_item=true requires last_item=true and the final step");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(name: &str, order: u32) -> StepState {
        StepState::new(StepName::from(name), order, name)
    }

    #[test]
    fn dense_orders_accepted() {
        let plan = StepPlan::new(vec![step("issues", 1), step("comments", 2)]);
        assert!(plan.is_ok());
    }

    #[test]
    fn sparse_orders_rejected() {
        let plan = StepPlan::new(vec![step("issues", 1), step("comments", 3)]);
        assert!(plan.is_err());
    }

    #[test]
    fn iter_respects_order_regardless_of_insertion() {
        let plan = StepPlan::new(vec![step("comments", 2), step("issues", 1)]).unwrap();
        let names: Vec<_> = plan.iter().map(|s| s.name.0.clone()).collect();
        assert_eq!(names, vec!["issues".to_string(), "comments".to_string()]);
    }

    #[test]
    fn is_last_step_detects_final_order() {
        let plan = StepPlan::new(vec![step("issues", 1), step("comments", 2)]).unwrap();
        assert!(!plan.is_last_step(&StepName::from("issues")));
        assert!(plan.is_last_step(&StepName::from("comments")));
    }

    #[test]
    fn flag_bracket_single_step_job_is_last_job_item() {
        let fb = FlagBracket::single(true);
        assert!(fb.validate(true).is_ok());
        assert!(fb.validate(false).is_err());
    }

    #[test]
    fn substatus_transitions() {
        assert!(SubStatus::Idle.can_transition_to(SubStatus::Running));
        assert!(SubStatus::Running.can_transition_to(SubStatus::Finished));
        assert!(SubStatus::Idle.can_transition_to(SubStatus::Failed));
        assert!(!SubStatus::Finished.can_transition_to(SubStatus::Running));
    }
}
