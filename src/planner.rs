//! Planner: turns a user-supplied goal into a DAG-of-steps `Plan`, asking
//! the backend once for a JSON plan and falling back to a single step on
//! parse failure (§4.7 Plan mode).

use serde::{Deserialize, Serialize};

use crate::backend::ModelBackend;

const PLAN_SYSTEM_PROMPT: &str = "You are a planning assistant for a coding agent. Given a goal, \
produce a JSON object with fields `summary` (string) and `steps` (array). Each step has `id` \
(string), `description` (string), `step_type` (one of: read, code, test, review, other), and \
`dependencies` (array of step ids that must complete first). Respond with JSON only, no prose.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    Read,
    Code,
    Test,
    Review,
    Other,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanStep {
    pub id: String,
    pub description: String,
    #[serde(rename = "step_type")]
    pub step_type: StepType,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub done: bool,
    #[serde(default)]
    pub files: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub goal: String,
    pub summary: String,
    pub steps: Vec<PlanStep>,
}

impl Plan {
    /// A single-step fallback plan used when the model's JSON plan could
    /// not be parsed.
    pub fn fallback(goal: impl Into<String>) -> Self {
        let goal = goal.into();
        Self {
            summary: format!("Single-step fallback plan for: {goal}"),
            steps: vec![PlanStep {
                id: "s1".into(),
                description: goal.clone(),
                step_type: StepType::Code,
                dependencies: Vec::new(),
                done: false,
                files: Vec::new(),
            }],
            goal,
        }
    }

    /// Steps whose dependencies are all done and which are not yet done
    /// themselves, in plan order.
    pub fn ready_steps(&self) -> Vec<&PlanStep> {
        self.steps
            .iter()
            .filter(|s| !s.done)
            .filter(|s| s.dependencies.iter().all(|dep| self.is_done(dep)))
            .collect()
    }

    fn is_done(&self, step_id: &str) -> bool {
        self.steps.iter().any(|s| s.id == step_id && s.done)
    }

    pub fn mark_done(&mut self, step_id: &str) {
        if let Some(step) = self.steps.iter_mut().find(|s| s.id == step_id) {
            step.done = true;
        }
    }

    pub fn is_complete(&self) -> bool {
        self.steps.iter().all(|s| s.done)
    }
}

#[derive(Deserialize)]
struct RawPlan {
    summary: String,
    steps: Vec<PlanStep>,
}

pub struct Planner {
    backend: std::sync::Arc<dyn ModelBackend>,
}

impl Planner {
    pub fn new(backend: std::sync::Arc<dyn ModelBackend>) -> Self {
        Self { backend }
    }

    /// Ask the backend once for a JSON plan for `goal`. Falls back to a
    /// single-step plan on any parse failure rather than propagating an
    /// error — plan generation must always produce something executable.
    pub async fn plan(&self, goal: &str) -> Plan {
        let reply = match self.backend.generate(goal, Some(PLAN_SYSTEM_PROMPT)).await {
            Ok(reply) => reply,
            Err(_) => return Plan::fallback(goal),
        };

        match parse_plan_json(&reply) {
            Some(raw) => Plan { goal: goal.to_owned(), summary: raw.summary, steps: raw.steps },
            None => Plan::fallback(goal),
        }
    }
}

fn parse_plan_json(reply: &str) -> Option<RawPlan> {
    let start = reply.find('{')?;
    let end = reply.rfind('}')?;
    if end < start {
        return None;
    }
    serde_json::from_str(&reply[start..=end]).ok()
}
