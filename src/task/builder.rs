//! Resolve repositories x steps into executable tasks.

use std::collections::HashMap;

use step_spec::{evaluate_condition, Step, TemplateContext, ValidationResult};
use tracing::debug;

use super::{Repository, Task, TaskId};

/// Builds tasks from a validated step list.
///
/// Validation happens once in [`TaskBuilder::new`], before any repository is
/// touched. Per repository the builder then:
///
/// - fills `env` entries without a value from the host environment
///   (variables the host does not define are dropped)
/// - evaluates `if` conditions that only reference `repository.*` and drops
///   steps that evaluate to false
///
/// Conditions that depend on step outputs are left for the runner.
#[derive(Debug, Clone)]
pub struct TaskBuilder {
    steps: Vec<Step>,
    host_env: HashMap<String, String>,
}

impl TaskBuilder {
    pub fn new(steps: Vec<Step>) -> ValidationResult<Self> {
        Step::validate_all(&steps)?;
        Ok(Self {
            steps,
            host_env: std::env::vars().collect(),
        })
    }

    /// Replace the environment used to resolve inherited variables.
    pub fn with_host_env(mut self, env: HashMap<String, String>) -> Self {
        self.host_env = env;
        self
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    /// Build one task per repository. Repositories whose steps are all
    /// skipped produce no task.
    pub fn build(&self, repositories: &[Repository]) -> Vec<Task> {
        let mut tasks = Vec::with_capacity(repositories.len());
        for repository in repositories {
            let steps = self.steps_for(repository);
            if steps.is_empty() {
                debug!(repository = %repository, "all steps skipped, no task created");
                continue;
            }
            tasks.push(Task {
                id: TaskId(tasks.len()),
                repository: repository.clone(),
                steps,
            });
        }
        tasks
    }

    fn steps_for(&self, repository: &Repository) -> Vec<Step> {
        let ctx = TemplateContext::new().with("repository", repository.template_value());
        let mut resolved = Vec::with_capacity(self.steps.len());

        for (index, step) in self.steps.iter().enumerate() {
            let mut step = step.clone();

            if let Some(condition) = step.condition.take() {
                if condition.is_static() {
                    if !evaluate_condition(&condition, &ctx) {
                        debug!(repository = %repository, step = index, "step skipped by condition");
                        continue;
                    }
                } else {
                    step.condition = Some(condition);
                }
            }

            step.env = step
                .env
                .into_iter()
                .filter_map(|(name, value)| match value {
                    Some(value) => Some((name, Some(value))),
                    None => self
                        .host_env
                        .get(&name)
                        .map(|inherited| (name, Some(inherited.clone()))),
                })
                .collect();

            resolved.push(step);
        }
        resolved
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use step_spec::{Condition, ValidationError};

    fn repos() -> Vec<Repository> {
        vec![
            Repository::new("r1", "github.com/acme/api", "aaa"),
            Repository::new("r2", "github.com/acme/web", "bbb"),
        ]
    }

    #[test]
    fn test_validation_happens_up_front() {
        let mut bad = Step::docker_image("alpine:3", ["true"]);
        bad.dockerfile = Some("FROM alpine:3".into());
        let err = TaskBuilder::new(vec![Step::command(["true"]), bad]).unwrap_err();
        assert_eq!(err, ValidationError::ImageSource { step: 1 });

        assert_eq!(
            TaskBuilder::new(Vec::new()).unwrap_err(),
            ValidationError::NoSteps
        );
    }

    #[test]
    fn test_one_task_per_repository() {
        let builder = TaskBuilder::new(vec![Step::command(["true"])]).unwrap();
        let tasks = builder.build(&repos());
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].id, TaskId(0));
        assert_eq!(tasks[1].repository.name, "github.com/acme/web");
    }

    #[test]
    fn test_static_condition_prunes_per_repository() {
        let mut unset = Step::command(["touch", "UNSET"]);
        unset.condition = Some(Condition::Template("${{ repository.missing }}".into()));
        let mut named = Step::command(["touch", "NAMED"]);
        named.condition = Some(Condition::Template("${{ repository.name }}".into()));

        let builder = TaskBuilder::new(vec![Step::command(["true"]), unset, named]).unwrap();
        let tasks = builder.build(&repos());
        assert_eq!(tasks[0].steps.len(), 2);
        assert_eq!(tasks[0].steps[1].args, vec!["touch", "NAMED"]);
        assert!(tasks[0].steps[1].condition.is_none());
    }

    #[test]
    fn test_all_steps_skipped_drops_task() {
        let mut step = Step::command(["true"]);
        step.condition = Some(Condition::Bool(false));
        let builder = TaskBuilder::new(vec![step]).unwrap();
        assert!(builder.build(&repos()).is_empty());
    }

    #[test]
    fn test_runtime_condition_kept() {
        let mut step = Step::command(["true"]);
        step.condition = Some(Condition::Template("${{ outputs.flag }}".into()));
        let builder = TaskBuilder::new(vec![step.clone()]).unwrap();
        let tasks = builder.build(&repos());
        assert_eq!(tasks[0].steps[0].condition, step.condition);
    }

    #[test]
    fn test_env_inherited_from_host() {
        let mut step = Step::command(["env"]);
        step.env.insert("FROM_HOST".into(), None);
        step.env.insert("MISSING".into(), None);
        step.env.insert("EXPLICIT".into(), Some("x".into()));

        let host = HashMap::from([("FROM_HOST".to_string(), "hello".to_string())]);
        let builder = TaskBuilder::new(vec![step]).unwrap().with_host_env(host);
        let tasks = builder.build(&repos()[..1]);

        let env = &tasks[0].steps[0].env;
        assert_eq!(env.get("FROM_HOST"), Some(&Some("hello".to_string())));
        assert_eq!(env.get("EXPLICIT"), Some(&Some("x".to_string())));
        assert!(!env.contains_key("MISSING"));
    }
}
