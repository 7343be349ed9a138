//! Candidate selection query.
//!
//! The same [`CandidateQuery`] drives both backends: [`CandidateQuery::to_sql`]
//! renders a parameterized statement for SQL stores, while
//! [`CandidateQuery::matches`] and [`dispatch_order`] give the in-memory store
//! identical semantics.

use std::cmp::Ordering;

use overseer_core::{GoalId, Task, TaskId, TaskStatus};
use serde::{Deserialize, Serialize};

/// Columns selected for a task row.
pub(crate) const TASK_COLUMNS: &str = "id, goal_id, title, description, prd_content, priority, \
     task_type, skill, status, payload, metadata, error, created_at, updated_at, started_at, completed_at";

/// Parameters of one "next queued task" lookup.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateQuery {
    /// Goals the task must belong to. `None` leaves goals unrestricted;
    /// an empty list matches nothing.
    pub goal_scope: Option<Vec<GoalId>>,

    /// Task ids to skip (candidates already rejected this tick).
    pub exclude_ids: Vec<TaskId>,
}

/// A rendered SQL statement with positional `?` arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Statement {
    /// SQL text
    pub sql: String,
    /// Arguments in placeholder order
    pub args: Vec<String>,
}

impl CandidateQuery {
    /// Create a query over the given goal scope with no exclusions.
    pub fn new(goal_scope: Option<Vec<GoalId>>) -> Self {
        Self {
            goal_scope,
            exclude_ids: Vec::new(),
        }
    }

    /// Replace the exclusion list.
    pub fn excluding(mut self, ids: &[TaskId]) -> Self {
        self.exclude_ids = ids.to_vec();
        self
    }

    /// Whether an exclusion clause will be emitted.
    pub fn has_exclusions(&self) -> bool {
        !self.exclude_ids.is_empty()
    }

    /// Render the statement. No exclusion clause is emitted at all when the
    /// exclusion list is empty.
    pub fn to_sql(&self) -> Statement {
        let mut sql = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE status = 'queued'");
        let mut args = Vec::new();

        if let Some(goals) = &self.goal_scope {
            if goals.is_empty() {
                sql.push_str(" AND 1 = 0");
            } else {
                sql.push_str(" AND goal_id IN (");
                sql.push_str(&placeholders(goals.len()));
                sql.push(')');
                args.extend(goals.iter().map(|g| g.to_string()));
            }
        }

        if self.has_exclusions() {
            sql.push_str(" AND id NOT IN (");
            sql.push_str(&placeholders(self.exclude_ids.len()));
            sql.push(')');
            args.extend(self.exclude_ids.iter().map(|id| id.to_string()));
        }

        sql.push_str(
            " ORDER BY CASE priority WHEN 'P0' THEN 0 WHEN 'P1' THEN 1 WHEN 'P2' THEN 2 ELSE 3 END, \
             created_at ASC, id ASC LIMIT 1",
        );

        Statement { sql, args }
    }

    /// Whether a task satisfies this query.
    pub fn matches(&self, task: &Task) -> bool {
        if task.status != TaskStatus::Queued {
            return false;
        }
        if let Some(goals) = &self.goal_scope {
            match task.goal_id {
                Some(goal) if goals.contains(&goal) => {}
                _ => return false,
            }
        }
        !self.exclude_ids.contains(&task.id)
    }
}

/// Dispatch order: priority tier, then creation time, then id.
/// Unknown priorities sort after every valid tier.
pub fn dispatch_order(a: &Task, b: &Task) -> Ordering {
    let rank = |t: &Task| t.priority_tier().map(|p| p.rank()).unwrap_or(u8::MAX);
    rank(a)
        .cmp(&rank(b))
        .then_with(|| a.created_at.cmp(&b.created_at))
        .then_with(|| a.id.cmp(&b.id))
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_exclusion_clause_when_empty() {
        let stmt = CandidateQuery::new(None).to_sql();
        assert!(!stmt.sql.contains("NOT IN"));
        assert!(stmt.args.is_empty());
    }

    #[test]
    fn test_exclusion_clause_covers_all_ids() {
        let a = TaskId::new();
        let b = TaskId::new();
        let stmt = CandidateQuery::new(None).excluding(&[a, b]).to_sql();

        assert!(stmt.sql.contains("AND id NOT IN (?, ?)"));
        assert_eq!(stmt.args, vec![a.to_string(), b.to_string()]);
    }

    #[test]
    fn test_exclusion_clause_dropped_again_after_reset() {
        let a = TaskId::new();
        let query = CandidateQuery::new(None).excluding(&[a]);
        assert!(query.to_sql().sql.contains("NOT IN"));

        let query = query.excluding(&[]);
        assert!(!query.to_sql().sql.contains("NOT IN"));
    }

    #[test]
    fn test_goal_scope_placeholders_precede_exclusions() {
        let g = GoalId::new();
        let t = TaskId::new();
        let stmt = CandidateQuery::new(Some(vec![g])).excluding(&[t]).to_sql();

        assert!(stmt.sql.contains("goal_id IN (?)"));
        assert_eq!(stmt.args, vec![g.to_string(), t.to_string()]);
    }

    #[test]
    fn test_empty_goal_scope_matches_nothing() {
        let query = CandidateQuery::new(Some(vec![]));
        assert!(query.to_sql().sql.contains("1 = 0"));
        assert!(!query.matches(&Task::new("title", "desc")));
    }

    #[test]
    fn test_matches_respects_status_and_exclusions() {
        let task = Task::new("title", "desc");
        assert!(CandidateQuery::default().matches(&task));
        assert!(!CandidateQuery::default().excluding(&[task.id]).matches(&task));

        let mut running = task.clone();
        running.status = TaskStatus::InProgress;
        assert!(!CandidateQuery::default().matches(&running));
    }

    #[test]
    fn test_dispatch_order_priority_first() {
        let earlier = chrono::Utc::now() - chrono::Duration::hours(1);
        let old_p2 = Task::new("a", "d").with_priority("P2").with_created_at(earlier);
        let new_p0 = Task::new("b", "d").with_priority("P0");
        let bogus = Task::new("c", "d").with_priority("urgent").with_created_at(earlier);

        let mut tasks = vec![old_p2.clone(), bogus.clone(), new_p0.clone()];
        tasks.sort_by(dispatch_order);
        assert_eq!(tasks[0].id, new_p0.id);
        assert_eq!(tasks[1].id, old_p2.id);
        assert_eq!(tasks[2].id, bogus.id);
    }
}
