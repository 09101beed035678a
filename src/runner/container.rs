//! `docker run` argument construction.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::task::{short_digest, Repository};

/// Working directory of the repository inside containers.
pub const CONTAINER_WORKDIR: &str = "/work";

/// Directory under the cache dir holding per-image cache-dir mounts.
pub const CACHE_DIR_ROOT: &str = "action-exec-cache-dir";

/// A read-only bind mount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindMount {
    pub source: PathBuf,
    pub target: String,
}

/// Everything needed to start one container step.
#[derive(Debug, Clone)]
pub struct ContainerRun {
    pub image: String,
    pub args: Vec<String>,
    /// Variable names; values are passed through the docker process env.
    pub env: BTreeMap<String, String>,
    /// `--mount` value for the workspace.
    pub workspace_mount: String,
    pub cache_mounts: Vec<BindMount>,
    pub readonly_mounts: Vec<BindMount>,
    pub cidfile: PathBuf,
}

impl ContainerRun {
    pub fn run_args(&self) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "--rm".to_string(),
            "--init".to_string(),
            "--cidfile".to_string(),
            self.cidfile.display().to_string(),
            "--workdir".to_string(),
            CONTAINER_WORKDIR.to_string(),
            "--mount".to_string(),
            self.workspace_mount.clone(),
        ];
        for mount in &self.cache_mounts {
            args.push("--mount".to_string());
            args.push(format!(
                "type=bind,source={},target={}",
                mount.source.display(),
                mount.target
            ));
        }
        for mount in &self.readonly_mounts {
            args.push("--mount".to_string());
            args.push(format!(
                "type=bind,source={},target={},readonly",
                mount.source.display(),
                mount.target
            ));
        }
        for name in self.env.keys() {
            args.push("--env".to_string());
            args.push(name.clone());
        }
        args.push(self.image.clone());
        args.extend(self.args.iter().cloned());
        args
    }
}

/// Host directory backing the cache dirs of one (image, repository,
/// revision) combination.
pub fn cache_scope_dir(cache_dir: &Path, image: &str, repository: &Repository) -> PathBuf {
    let scope = short_digest(format!("{}{}{}", image, repository.name, repository.rev).as_bytes());
    cache_dir.join(CACHE_DIR_ROOT).join(scope)
}

/// Mount for one `cacheDirs` entry. Absolute entries keep their path in the
/// container; relative ones are placed under the working directory.
pub fn cache_mount(scope_dir: &Path, dir: &str) -> BindMount {
    let dir = dir.trim();
    let relative = dir.trim_start_matches('/');
    let target = if dir.starts_with('/') {
        dir.to_string()
    } else {
        format!("{}/{}", CONTAINER_WORKDIR, relative)
    };
    BindMount {
        source: scope_dir.join(relative),
        target,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_mounts() {
        let repo = Repository::new("r1", "github.com/acme/api", "abc");
        let scope = cache_scope_dir(Path::new("/cache"), "sha256:img", &repo);
        assert!(scope.starts_with("/cache/action-exec-cache-dir"));
        assert_eq!(scope, cache_scope_dir(Path::new("/cache"), "sha256:img", &repo));
        assert_ne!(
            scope,
            cache_scope_dir(Path::new("/cache"), "sha256:img", &repo.at_revision("def"))
        );

        let abs = cache_mount(&scope, "/root/.npm");
        assert_eq!(abs.target, "/root/.npm");
        assert_eq!(abs.source, scope.join("root/.npm"));

        let rel = cache_mount(&scope, "node_modules");
        assert_eq!(rel.target, "/work/node_modules");
        assert_eq!(rel.source, scope.join("node_modules"));
    }

    #[test]
    fn test_run_args_order() {
        let run = ContainerRun {
            image: "sha256:img".into(),
            args: vec!["sh".into(), "-c".into(), "true".into()],
            env: BTreeMap::from([("TOKEN".to_string(), "secret".to_string())]),
            workspace_mount: "type=bind,source=/ws,target=/work".into(),
            cache_mounts: vec![BindMount {
                source: PathBuf::from("/cache/x"),
                target: "/root/.cache".into(),
            }],
            readonly_mounts: vec![BindMount {
                source: PathBuf::from("/tmp/f0"),
                target: "/etc/config.json".into(),
            }],
            cidfile: PathBuf::from("/tmp/cid"),
        };
        let args = run.run_args();
        assert_eq!(&args[..5], ["run", "--rm", "--init", "--cidfile", "/tmp/cid"]);
        assert!(args.contains(&"type=bind,source=/cache/x,target=/root/.cache".to_string()));
        assert!(args.contains(&"type=bind,source=/tmp/f0,target=/etc/config.json,readonly".to_string()));
        // env values never appear on the command line
        assert!(!args.iter().any(|a| a.contains("secret")));
        let image_at = args.iter().position(|a| a == "sha256:img").unwrap();
        assert_eq!(&args[image_at + 1..], ["sh", "-c", "true"]);
        assert_eq!(args[image_at - 1], "TOKEN");
    }
}
