//! Repository checkout at an exact commit

use crate::compiler::script::shell_quote;
use crate::core::error::StageExecutionError;
use crate::runtime::CommandRunner;
use std::path::Path;
use tracing::info;

fn checkout_error(commit: &str, reason: impl Into<String>) -> StageExecutionError {
    StageExecutionError::Checkout {
        commit: commit.to_string(),
        reason: reason.into(),
    }
}

/// Clone `repo_url` into `dir` and check out `commit`
///
/// Fails unless `git rev-parse HEAD` afterwards names exactly `commit`.
pub async fn checkout<R: CommandRunner + ?Sized>(
    runner: &R,
    repo_url: &str,
    commit: &str,
    dir: &Path,
) -> Result<(), StageExecutionError> {
    let parent = dir.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent)
        .map_err(|e| checkout_error(commit, format!("cannot create {}: {}", parent.display(), e)))?;

    info!("Cloning {} into {}", repo_url, dir.display());
    let clone = format!(
        "git clone {} {}",
        shell_quote(repo_url),
        shell_quote(&dir.to_string_lossy())
    );
    run_git(runner, &clone, parent, commit).await?;

    info!("Checking out commit {}", commit);
    run_git(
        runner,
        &format!("git checkout {}", shell_quote(commit)),
        dir,
        commit,
    )
    .await?;

    let head = run_git(runner, "git rev-parse HEAD", dir, commit).await?;
    let head = head.trim();
    if head != commit {
        return Err(checkout_error(
            commit,
            format!("HEAD is at {} after checkout", head),
        ));
    }

    info!("Checked out {}", commit);
    Ok(())
}

async fn run_git<R: CommandRunner + ?Sized>(
    runner: &R,
    command: &str,
    dir: &Path,
    commit: &str,
) -> Result<String, StageExecutionError> {
    let output = runner
        .run(command, dir, &[])
        .await
        .map_err(|e| checkout_error(commit, format!("`{}`: {}", command, e)))?;
    if !output.success() {
        return Err(checkout_error(
            commit,
            format!(
                "`{}` exited with code {}: {}",
                command,
                output.exit_code,
                output.stderr.trim()
            ),
        ));
    }
    Ok(output.stdout)
}
