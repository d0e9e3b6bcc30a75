//! Agent fitness scoring
//!
//! score = 100 + 20 * (health / max_health) - distance / 10 - 10 * surplus
//!
//! `surplus` counts the agent's capabilities beyond what the task needs, so a
//! specialist outranks a generalist when both qualify.

use crate::agents::AgentRecord;

use super::types::Task;

const BASE_SCORE: f64 = 100.0;
const HEALTH_WEIGHT: f64 = 20.0;
const DISTANCE_DIVISOR: f64 = 10.0;
const SURPLUS_PENALTY: f64 = 10.0;

/// Score an eligible agent for a task. Callers filter on capabilities first.
pub fn fitness_score(agent: &AgentRecord, task: &Task, max_health: f64) -> f64 {
    let health = if max_health > 0.0 {
        HEALTH_WEIGHT * (agent.health / max_health)
    } else {
        0.0
    };

    let distance_penalty = match (task.location, agent.position) {
        (Some(target), Some(position)) => position.planar_distance(&target) / DISTANCE_DIVISOR,
        _ => 0.0,
    };

    let matched = task
        .required_capabilities
        .iter()
        .filter(|c| agent.has_capability(c))
        .count();
    let surplus = agent.capabilities.len().saturating_sub(matched);

    BASE_SCORE + health - distance_penalty - SURPLUS_PENALTY * surplus as f64
}

/// Highest-scoring candidate. On a tie the earliest candidate wins, which
/// follows directory registration order. A NaN score (bad health or
/// position data) ranks below every real score.
pub fn select_best<'a>(
    candidates: impl IntoIterator<Item = &'a AgentRecord>,
    task: &Task,
    max_health: f64,
) -> Option<(&'a AgentRecord, f64)> {
    let mut best: Option<(&AgentRecord, f64)> = None;
    for agent in candidates {
        let score = fitness_score(agent, task, max_health);
        let score = if score.is_nan() { f64::NEG_INFINITY } else { score };
        match best {
            Some((_, best_score)) if score <= best_score => {}
            _ => best = Some((agent, score)),
        }
    }
    best
}
