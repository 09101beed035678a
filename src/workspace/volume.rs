//! Moving trees in and out of docker volumes.
//!
//! Both directions run a short-lived helper container with the volume and a
//! host directory mounted side by side and copy with `cp -a`.

use std::path::Path;
use std::process::Command;

use super::WorkspaceResult;
use crate::docker::{DockerCli, DockerError};
use crate::process::{self, Supervision};
use crate::signal::CancelToken;

/// Image used for the copy helper.
pub const HELPER_IMAGE: &str = "alpine:3";

fn copy_args(volume: &str, host_dir: &Path, from_volume: bool) -> Vec<String> {
    let (src, dst) = if from_volume {
        ("/volume", "/host")
    } else {
        ("/host", "/volume")
    };
    vec![
        "run".to_string(),
        "--rm".to_string(),
        "--mount".to_string(),
        format!("type=volume,source={},target=/volume", volume),
        "--mount".to_string(),
        format!("type=bind,source={},target=/host", host_dir.display()),
        HELPER_IMAGE.to_string(),
        "cp".to_string(),
        "-a".to_string(),
        format!("{}/.", src),
        format!("{}/", dst),
    ]
}

fn run_copy(
    docker: &DockerCli,
    args: Vec<String>,
    cancel: Option<&CancelToken>,
) -> WorkspaceResult<()> {
    let mut cmd: Command = docker.command();
    cmd.args(&args);
    let output = process::run_supervised(
        &mut cmd,
        Supervision {
            cancel,
            ..Supervision::default()
        },
        None,
    )
    .map_err(DockerError::from)?;
    if !output.success() {
        return Err(DockerError::Failed {
            operation: "run (volume copy)",
            code: output.exit_code(),
            stderr: output.stderr.trim().to_string(),
        }
        .into());
    }
    Ok(())
}

/// Copy the contents of `host_dir` into the volume.
pub fn seed(
    docker: &DockerCli,
    volume: &str,
    host_dir: &Path,
    cancel: Option<&CancelToken>,
) -> WorkspaceResult<()> {
    run_copy(docker, copy_args(volume, host_dir, false), cancel)
}

/// Copy the contents of the volume into `host_dir`.
pub fn export(
    docker: &DockerCli,
    volume: &str,
    host_dir: &Path,
    cancel: Option<&CancelToken>,
) -> WorkspaceResult<()> {
    run_copy(docker, copy_args(volume, host_dir, true), cancel)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_copy_direction() {
        let seed = copy_args("vol1", Path::new("/tmp/seed"), false);
        assert_eq!(seed[3], "type=volume,source=vol1,target=/volume");
        assert_eq!(seed[5], "type=bind,source=/tmp/seed,target=/host");
        assert_eq!(&seed[seed.len() - 2..], ["/host/.", "/volume/"]);

        let export = copy_args("vol1", Path::new("/tmp/export"), true);
        assert_eq!(&export[export.len() - 2..], ["/volume/.", "/host/"]);
    }
}
