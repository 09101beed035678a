//! Shared fixtures: a local archive store, cache and scratch directories.

#![allow(dead_code)]

use std::collections::BTreeSet;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;

use batch_exec::cache::{DiskCache, ExecutionCache};
use batch_exec::diff::DiffTool;
use batch_exec::docker::{DockerCli, ImageResolver};
use batch_exec::runner::StepRunner;
use batch_exec::workspace::{ArchiveSource, Provisioner};
use batch_exec::{Coordinator, CoordinatorConfig, Repository, Step, TaskTimeout, WorkspaceMode};
use tempfile::TempDir;

pub struct Harness {
    pub temp: TempDir,
}

impl Harness {
    pub fn new() -> Self {
        Self {
            temp: TempDir::new().unwrap(),
        }
    }

    pub fn store_dir(&self) -> PathBuf {
        self.temp.path().join("store")
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.temp.path().join("cache")
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.temp.path().join("tmp")
    }

    /// A file outside every workspace, for steps to record side effects.
    pub fn side_file(&self, name: &str) -> PathBuf {
        self.temp.path().join(name)
    }

    /// Add a repository snapshot to the store.
    pub fn add_repo(&self, name: &str, rev: &str, files: &[(&str, &str)]) -> Repository {
        let repo = Repository::new(&format!("id-{}", name), name, rev);
        let path = ArchiveSource::store_path(&self.store_dir(), &repo);
        fs::create_dir_all(path.parent().unwrap()).unwrap();

        let mut builder = tar::Builder::new(File::create(&path).unwrap());
        for (file, content) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(content.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder
                .append_data(&mut header, file, content.as_bytes())
                .unwrap();
        }
        builder.finish().unwrap();
        repo
    }

    pub fn config(&self, parallelism: usize) -> CoordinatorConfig {
        CoordinatorConfig {
            parallelism,
            timeout: TaskTimeout::default(),
            keep_logs: false,
            skip_errors: false,
            workspace_mode: WorkspaceMode::Bind,
            log_dir: self.tmp_dir(),
        }
    }

    pub fn coordinator(&self, config: CoordinatorConfig) -> Coordinator {
        self.coordinator_with_cache(config, ExecutionCache::Disk(DiskCache::new(self.cache_dir())))
    }

    pub fn coordinator_with_cache(
        &self,
        config: CoordinatorConfig,
        cache: ExecutionCache,
    ) -> Coordinator {
        self.coordinator_with_docker(config, cache, DockerCli::default())
    }

    pub fn coordinator_with_docker(
        &self,
        config: CoordinatorConfig,
        cache: ExecutionCache,
        docker: DockerCli,
    ) -> Coordinator {
        Coordinator::new(
            config,
            cache,
            Provisioner::new(
                ArchiveSource::store(self.store_dir()),
                self.tmp_dir(),
                docker.clone(),
            ),
            StepRunner::new(docker.clone(), self.cache_dir(), self.tmp_dir()),
            ImageResolver::new(docker),
            DiffTool::default(),
        )
    }

    /// Cache entries currently on disk.
    pub fn cache_files(&self) -> Vec<PathBuf> {
        match fs::read_dir(self.cache_dir()) {
            Ok(entries) => entries
                .map(|e| e.unwrap().path())
                .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
                .collect(),
            Err(_) => Vec::new(),
        }
    }

    /// Workspaces still present under the scratch directory.
    pub fn leftover_workspaces(&self) -> usize {
        match fs::read_dir(self.tmp_dir()) {
            Ok(entries) => entries
                .filter_map(|e| e.ok())
                .filter(|e| {
                    e.file_name()
                        .to_string_lossy()
                        .starts_with("batch-exec-workspace-")
                })
                .count(),
            Err(_) => 0,
        }
    }
}

/// An executable shell script standing in for the docker CLI.
#[cfg(unix)]
pub fn fake_docker(dir: &Path, script: &str) -> DockerCli {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join("docker");
    fs::write(&path, format!("#!/bin/sh\n{}\n", script)).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    DockerCli::new(path)
}

pub fn sh(script: &str) -> Step {
    Step::command(["sh", "-c", script])
}

pub fn timeout(secs: u64) -> TaskTimeout {
    TaskTimeout::new(Duration::from_secs(secs)).unwrap()
}

fn responds(program: &str, args: &[&str]) -> bool {
    Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

pub fn diff_available() -> bool {
    responds("diff", &["--version"])
}

pub fn docker_available() -> bool {
    responds("docker", &["info"])
}

/// Names of the docker volumes that currently exist.
pub fn docker_volumes() -> BTreeSet<String> {
    let output = Command::new("docker")
        .args(["volume", "ls", "--quiet"])
        .stdin(Stdio::null())
        .output()
        .unwrap();
    assert!(output.status.success());
    String::from_utf8_lossy(&output.stdout)
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}

pub fn read_lines(path: &Path) -> Vec<String> {
    fs::read_to_string(path)
        .unwrap_or_default()
        .lines()
        .map(str::to_string)
        .collect()
}
