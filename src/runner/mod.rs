//! Step execution.
//!
//! Runs a task's steps in order inside its workspace, stopping at the first
//! failure. Before each step the runner evaluates any remaining `if`
//! condition and renders arguments, environment values and file contents
//! against the template context:
//!
//! - `repository.*` the materialized repository
//! - `outputs.*` outputs declared by earlier steps
//! - `previous_step.stdout|stderr|exit_code` the last step that ran
//!
//! After a step succeeds its declared outputs are rendered with
//! `step.stdout|stderr` available and decoded per their format.

mod container;

pub use container::{
    cache_mount, cache_scope_dir, BindMount, ContainerRun, CACHE_DIR_ROOT, CONTAINER_WORKDIR,
};

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Map, Value};
use step_spec::{decode_output, evaluate_condition, render, OutputError, Step, StepKind, TemplateContext};
use thiserror::Error;
use tracing::{debug, info};

use crate::docker::DockerCli;
use crate::log::TaskLog;
use crate::process::{self, ProcessError, ProcessOutput, Supervision};
use crate::signal::CancelToken;
use crate::task::Repository;
use crate::timeout::Deadline;
use crate::workspace::Workspace;

#[derive(Debug, Error)]
pub enum StepError {
    #[error("step {step} failed with {}", describe_exit(.exit_code))]
    Failed { step: usize, exit_code: Option<i32> },

    #[error("step {step}: {source}")]
    Process {
        step: usize,
        #[source]
        source: ProcessError,
    },

    #[error("step {step}: {source}")]
    Output {
        step: usize,
        #[source]
        source: OutputError,
    },

    #[error("step {step}: preparing mounts: {source}")]
    Mounts {
        step: usize,
        #[source]
        source: io::Error,
    },

    #[error("step {step}: container image has not been resolved")]
    UnresolvedImage { step: usize },

    #[error("step {step}: host command needs a host workspace")]
    NoHostWorkspace { step: usize },

    #[error("step {step} timed out after {timeout:?}")]
    TimedOut { step: usize, timeout: Duration },

    #[error("step {step} cancelled")]
    Cancelled { step: usize },
}

pub type StepResult<T> = Result<T, StepError>;

fn describe_exit(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {}", code),
        None => "no exit code (killed by signal)".to_string(),
    }
}

impl StepError {
    fn from_process(step: usize, source: ProcessError) -> Self {
        match source {
            ProcessError::TimedOut { timeout, .. } => StepError::TimedOut { step, timeout },
            ProcessError::Cancelled { .. } => StepError::Cancelled { step },
            source => StepError::Process { step, source },
        }
    }
}

/// Per-task execution handles.
pub struct StepContext<'a> {
    pub workspace: &'a Workspace,
    pub log: Arc<TaskLog>,
    pub deadline: &'a Deadline,
    pub cancel: &'a CancelToken,
    /// Called with the step index before each step that runs.
    pub on_step: Option<&'a (dyn Fn(usize) + Sync)>,
}

impl StepContext<'_> {
    fn supervision(&self) -> Supervision<'_> {
        Supervision {
            deadline: Some(self.deadline),
            cancel: Some(self.cancel),
        }
    }
}

/// Runs steps against a workspace.
#[derive(Debug, Clone)]
pub struct StepRunner {
    docker: DockerCli,
    cache_dir: PathBuf,
    temp_dir: PathBuf,
}

impl StepRunner {
    pub fn new(docker: DockerCli, cache_dir: impl Into<PathBuf>, temp_dir: impl Into<PathBuf>) -> Self {
        Self {
            docker,
            cache_dir: cache_dir.into(),
            temp_dir: temp_dir.into(),
        }
    }

    /// Run all steps. Returns the accumulated outputs.
    pub fn run_steps(&self, steps: &[Step], ctx: &StepContext<'_>) -> StepResult<BTreeMap<String, Value>> {
        let repository = ctx.workspace.repository();
        let mut outputs: BTreeMap<String, Value> = BTreeMap::new();
        let mut previous: Option<Value> = None;

        for (index, step) in steps.iter().enumerate() {
            let mut template = base_context(repository, &outputs);
            if let Some(prev) = &previous {
                template.set("previous_step", prev.clone());
            }

            if let Some(condition) = &step.condition {
                if !evaluate_condition(condition, &template) {
                    info!(repository = %repository, step = index, "step skipped by condition");
                    ctx.log.line("step", &format!("{} skipped", index));
                    continue;
                }
            }

            if let Some(on_step) = ctx.on_step {
                on_step(index);
            }

            let args: Vec<String> = step.args.iter().map(|a| render(a, &template)).collect();
            let env: BTreeMap<String, String> = step
                .env
                .iter()
                .filter_map(|(k, v)| v.as_ref().map(|v| (k.clone(), render(v, &template))))
                .collect();

            ctx.log.line("step", &format!("{} {}: {}", index, step.kind, args.join(" ")));
            debug!(repository = %repository, step = index, kind = %step.kind, args = ?args, "running step");

            let output = match step.kind {
                StepKind::Command => self.run_host(index, &args, &env, ctx)?,
                StepKind::Docker => self.run_container(index, step, args, env, &template, ctx)?,
            };

            if !output.success() {
                ctx.log.line("step", &format!("{} exited with {:?}", index, output.exit_code()));
                return Err(StepError::Failed {
                    step: index,
                    exit_code: output.exit_code(),
                });
            }

            let step_value = json!({
                "stdout": output.stdout,
                "stderr": output.stderr,
                "exit_code": output.exit_code(),
            });
            if !step.outputs.is_empty() {
                let mut out_ctx = template.clone();
                out_ctx.set("step", step_value.clone());
                for (name, spec) in &step.outputs {
                    let rendered = render(&spec.value, &out_ctx);
                    let value = decode_output(name, &rendered, spec.format)
                        .map_err(|source| StepError::Output { step: index, source })?;
                    outputs.insert(name.clone(), value);
                }
            }
            previous = Some(step_value);
        }

        Ok(outputs)
    }

    fn run_host(
        &self,
        index: usize,
        args: &[String],
        env: &BTreeMap<String, String>,
        ctx: &StepContext<'_>,
    ) -> StepResult<ProcessOutput> {
        let dir = ctx
            .workspace
            .host_dir()
            .ok_or(StepError::NoHostWorkspace { step: index })?;
        let (program, rest) = args
            .split_first()
            .ok_or(StepError::Failed { step: index, exit_code: None })?;

        let mut cmd = Command::new(program);
        cmd.args(rest).current_dir(dir).envs(env);
        process::run_supervised(&mut cmd, ctx.supervision(), Some(Arc::clone(&ctx.log)))
            .map_err(|e| StepError::from_process(index, e))
    }

    fn run_container(
        &self,
        index: usize,
        step: &Step,
        args: Vec<String>,
        env: BTreeMap<String, String>,
        template: &TemplateContext,
        ctx: &StepContext<'_>,
    ) -> StepResult<ProcessOutput> {
        let image = step
            .image_content_digest
            .clone()
            .ok_or(StepError::UnresolvedImage { step: index })?;
        let mounts_err = |source| StepError::Mounts { step: index, source };

        fs::create_dir_all(&self.temp_dir).map_err(mounts_err)?;
        let scratch = tempfile::Builder::new()
            .prefix("batch-exec-step-")
            .tempdir_in(&self.temp_dir)
            .map_err(mounts_err)?;

        let scope = cache_scope_dir(&self.cache_dir, &image, ctx.workspace.repository());
        let mut cache_mounts = Vec::with_capacity(step.cache_dirs.len());
        for dir in &step.cache_dirs {
            let mount = cache_mount(&scope, dir);
            fs::create_dir_all(&mount.source).map_err(mounts_err)?;
            cache_mounts.push(mount);
        }

        let mut readonly_mounts = Vec::new();
        for (n, (target, content)) in step.files.iter().enumerate() {
            let source = scratch.path().join(format!("file-{}", n));
            fs::write(&source, render(content, template)).map_err(mounts_err)?;
            readonly_mounts.push(BindMount {
                source,
                target: target.clone(),
            });
        }
        for mount in &step.mount {
            let source = absolute(Path::new(&mount.path)).map_err(mounts_err)?;
            readonly_mounts.push(BindMount {
                source,
                target: mount.mountpoint.clone(),
            });
        }

        let run = ContainerRun {
            image,
            args,
            env,
            workspace_mount: ctx.workspace.mount_arg(CONTAINER_WORKDIR),
            cache_mounts,
            readonly_mounts,
            cidfile: scratch.path().join("cid"),
        };

        let mut cmd = self.docker.command();
        cmd.args(run.run_args()).envs(&run.env);
        let result = process::run_supervised(&mut cmd, ctx.supervision(), Some(Arc::clone(&ctx.log)));

        if result.is_err() {
            // the docker client is gone but the container may still be running
            if let Ok(cid) = fs::read_to_string(&run.cidfile) {
                let cid = cid.trim();
                if !cid.is_empty() {
                    self.docker.remove_container(cid);
                }
            }
        }
        result.map_err(|e| StepError::from_process(index, e))
    }
}

fn base_context(repository: &Repository, outputs: &BTreeMap<String, Value>) -> TemplateContext {
    let outputs: Map<String, Value> = outputs.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
    TemplateContext::new()
        .with("repository", repository.template_value())
        .with("outputs", Value::Object(outputs))
}

fn absolute(path: &Path) -> io::Result<PathBuf> {
    path.canonicalize()
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::docker::DockerCli;
    use crate::timeout::TaskTimeout;
    use crate::workspace::{ArchiveSource, Provisioner, WorkspaceStrategy};
    use step_spec::{Condition, OutputFormat, OutputSpec};
    use tempfile::TempDir;

    struct Fixture {
        workspace: Workspace,
        log: Arc<TaskLog>,
        temp: TempDir,
    }

    fn fixture() -> Fixture {
        let temp = TempDir::new().unwrap();
        let repo = Repository::new("r1", "github.com/acme/api", "abc");
        let store = temp.path().join("store");
        let archive = ArchiveSource::store_path(&store, &repo);
        fs::create_dir_all(archive.parent().unwrap()).unwrap();
        let mut builder = tar::Builder::new(fs::File::create(&archive).unwrap());
        let mut header = tar::Header::new_gnu();
        header.set_size(4);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, "a.txt", "one\n".as_bytes()).unwrap();
        builder.finish().unwrap();

        let provisioner = Provisioner::new(
            ArchiveSource::store(&store),
            temp.path().join("tmp"),
            DockerCli::default(),
        );
        let workspace = provisioner
            .provision(&repo, WorkspaceStrategy::Bind, None)
            .unwrap();
        let log = Arc::new(TaskLog::create(&temp.path().join("logs"), "repo", true).unwrap());
        Fixture { workspace, log, temp }
    }

    fn runner(f: &Fixture) -> StepRunner {
        StepRunner::new(DockerCli::default(), f.temp.path().join("cache"), f.temp.path().join("tmp"))
    }

    fn sh(script: &str) -> Step {
        Step::command(["sh", "-c", script])
    }

    #[test]
    fn test_host_steps_mutate_workspace() {
        let f = fixture();
        let deadline = TaskTimeout::default().start();
        let cancel = CancelToken::new();
        let ctx = StepContext {
            workspace: &f.workspace,
            log: Arc::clone(&f.log),
            deadline: &deadline,
            cancel: &cancel,
            on_step: None,
        };

        let steps = vec![
            sh("echo hello > README.md"),
            sh("echo ${{ repository.name }} >> README.md"),
        ];
        runner(&f).run_steps(&steps, &ctx).unwrap();

        let dir = f.workspace.host_dir().unwrap();
        assert_eq!(
            fs::read_to_string(dir.join("README.md")).unwrap(),
            "hello\ngithub.com/acme/api\n"
        );
        let log = fs::read_to_string(f.log.path()).unwrap();
        assert!(log.contains("step: 0 command: sh -c echo hello > README.md"));
    }

    #[test]
    fn test_outputs_and_runtime_conditions() {
        let f = fixture();
        let deadline = TaskTimeout::default().start();
        let cancel = CancelToken::new();
        let ctx = StepContext {
            workspace: &f.workspace,
            log: Arc::clone(&f.log),
            deadline: &deadline,
            cancel: &cancel,
            on_step: None,
        };

        let mut produce = sh(r#"echo '{"count": 2, "skip": false}'"#);
        produce.outputs.insert(
            "report".into(),
            OutputSpec {
                value: "${{ step.stdout }}".into(),
                format: OutputFormat::Json,
            },
        );
        let mut skipped = sh("touch SKIPPED");
        skipped.condition = Some(Condition::Template("${{ outputs.report.skip }}".into()));
        let mut used = sh("echo ${{ outputs.report.count }} > COUNT");
        used.env.insert("PREV".into(), Some("${{ previous_step.exit_code }}".into()));
        let echo_env = sh("echo $PREV > PREV");
        let mut with_env = echo_env.clone();
        with_env.env = used.env.clone();

        let outputs = runner(&f)
            .run_steps(&[produce, skipped, used, with_env], &ctx)
            .unwrap();

        assert_eq!(outputs["report"]["count"], 2);
        let dir = f.workspace.host_dir().unwrap();
        assert!(!dir.join("SKIPPED").exists());
        assert_eq!(fs::read_to_string(dir.join("COUNT")).unwrap(), "2\n");
        assert_eq!(fs::read_to_string(dir.join("PREV")).unwrap(), "0\n");
    }

    #[test]
    fn test_failing_step_stops_execution() {
        let f = fixture();
        let deadline = TaskTimeout::default().start();
        let cancel = CancelToken::new();
        let ctx = StepContext {
            workspace: &f.workspace,
            log: Arc::clone(&f.log),
            deadline: &deadline,
            cancel: &cancel,
            on_step: None,
        };

        let err = runner(&f)
            .run_steps(&[sh("echo broken >&2; exit 4"), sh("touch NEVER")], &ctx)
            .unwrap_err();
        assert!(matches!(err, StepError::Failed { step: 0, exit_code: Some(4) }));
        assert!(!f.workspace.host_dir().unwrap().join("NEVER").exists());
        assert!(fs::read_to_string(f.log.path()).unwrap().contains("stderr: broken"));
    }

    #[test]
    fn test_step_timeout() {
        let f = fixture();
        let deadline = TaskTimeout::new(Duration::from_millis(300)).unwrap().start();
        let cancel = CancelToken::new();
        let ctx = StepContext {
            workspace: &f.workspace,
            log: Arc::clone(&f.log),
            deadline: &deadline,
            cancel: &cancel,
            on_step: None,
        };
        let err = runner(&f).run_steps(&[sh("sleep 30")], &ctx).unwrap_err();
        assert!(matches!(err, StepError::TimedOut { step: 0, timeout } if timeout == Duration::from_millis(300)));
    }

    #[test]
    fn test_bad_output_is_step_error() {
        let f = fixture();
        let deadline = TaskTimeout::default().start();
        let cancel = CancelToken::new();
        let ctx = StepContext {
            workspace: &f.workspace,
            log: Arc::clone(&f.log),
            deadline: &deadline,
            cancel: &cancel,
            on_step: None,
        };
        let mut step = sh("echo not-json");
        step.outputs.insert(
            "x".into(),
            OutputSpec {
                value: "${{ step.stdout }}".into(),
                format: OutputFormat::Json,
            },
        );
        let err = runner(&f).run_steps(&[step], &ctx).unwrap_err();
        assert!(matches!(err, StepError::Output { step: 0, .. }));
    }

    #[test]
    fn test_container_step_requires_pinned_image() {
        let f = fixture();
        let deadline = TaskTimeout::default().start();
        let cancel = CancelToken::new();
        let ctx = StepContext {
            workspace: &f.workspace,
            log: Arc::clone(&f.log),
            deadline: &deadline,
            cancel: &cancel,
            on_step: None,
        };
        let err = runner(&f)
            .run_steps(&[Step::docker_image("alpine:3", ["true"])], &ctx)
            .unwrap_err();
        assert!(matches!(err, StepError::UnresolvedImage { step: 0 }));
    }
}
