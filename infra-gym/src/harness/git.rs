use anyhow::{Context, Result};
use log::{debug, info, warn};
use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::{
    errors::HarnessError,
    models::{Invocation, Outcome},
    services::CommandRunner,
};

pub const BARE_CLONE_DIR: &str = "vllm.git";

fn git(cwd: &Path, args: &[&str], timeout_secs: u64) -> Invocation {
    Invocation::new("git")
        .args(args.iter().copied())
        .cwd(cwd)
        .timeout(Duration::from_secs(timeout_secs))
        .capture()
}

/// A hung `git apply` aborts the instance instead of counting as a rejected patch.
fn fail_on_timeout(invocation: &Invocation, outcome: &Outcome) -> Result<()> {
    if outcome.timed_out {
        return Err(HarnessError::CommandTimedOut {
            command: invocation.command_line(),
            seconds: invocation.timeout.map_or(0, |t| t.as_secs()),
        }
        .into());
    }

    Ok(())
}

/// Creates, or refreshes, the bare clone that every worktree borrows objects from.
pub fn ensure_bare_clone(
    runner: &mut dyn CommandRunner,
    workdir: &Path,
    repo_url: &str,
) -> Result<PathBuf> {
    let bare = workdir.join(BARE_CLONE_DIR);

    if bare.is_dir() {
        info!("reusing bare clone at {:?}", bare);
        let outcome = runner.run(&git(&bare, &["fetch", "--all"], 600))?;
        if !outcome.success() {
            warn!("git fetch failed on bare clone: {}", outcome.stderr.trim());
        }
        return Ok(bare);
    }

    info!("creating bare clone of {}", repo_url);
    fs::create_dir_all(workdir).with_context(|| format!("failed to create {:?}", workdir))?;
    let bare_arg = bare.to_string_lossy().into_owned();
    runner.run_checked(&git(workdir, &["clone", "--bare", repo_url, &bare_arg], 1200))?;

    Ok(bare)
}

/// Recreates `worktree` as a detached checkout of `commit`.
pub fn setup_worktree(
    runner: &mut dyn CommandRunner,
    bare: &Path,
    worktree: &Path,
    commit: &str,
) -> Result<()> {
    let worktree_arg = worktree.to_string_lossy().into_owned();
    runner.run(&git(bare, &["worktree", "prune"], 60))?;

    if worktree.is_dir() {
        info!("removing stale worktree {:?}", worktree);
        runner.run(&git(
            bare,
            &["worktree", "remove", "--force", &worktree_arg],
            60,
        ))?;
        // Files created by containers running as root can survive `worktree remove`.
        force_remove_dir(runner, worktree)?;
        runner.run(&git(bare, &["worktree", "prune"], 60))?;
    }

    let branch = format!(
        "harness-{}",
        worktree
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default()
    );
    runner.run(&git(bare, &["branch", "-D", &branch], 30))?;

    info!(
        "creating worktree at {:?} (commit {})",
        worktree,
        commit.chars().take(12).collect::<String>()
    );
    runner.run_checked(&git(
        bare,
        &["worktree", "add", "--detach", &worktree_arg, commit],
        300,
    ))?;

    Ok(())
}

pub fn cleanup_worktree(
    runner: &mut dyn CommandRunner,
    bare: &Path,
    worktree: &Path,
) -> Result<()> {
    let worktree_arg = worktree.to_string_lossy().into_owned();
    let removed = runner.run(&git(
        bare,
        &["worktree", "remove", "--force", &worktree_arg],
        60,
    ))?;
    if !removed.success() {
        force_remove_dir(runner, worktree)?;
    }
    runner.run(&git(bare, &["worktree", "prune"], 60))?;

    Ok(())
}

/// Removes a directory tree, escalating to `chmod -R` and then `sudo rm -rf` for trees
/// holding root-owned files.
pub fn force_remove_dir(runner: &mut dyn CommandRunner, path: &Path) -> Result<()> {
    if !path.is_dir() || fs::remove_dir_all(path).is_ok() {
        return Ok(());
    }

    let path_arg = path.to_string_lossy().into_owned();
    let timeout = Duration::from_secs(60);

    runner.run(
        &Invocation::new("chmod")
            .args(vec!["-R", "u+rwX", path_arg.as_str()])
            .timeout(timeout)
            .capture(),
    )?;
    if fs::remove_dir_all(path).is_ok() {
        return Ok(());
    }

    let outcome = runner.run(
        &Invocation::new("sudo")
            .args(vec!["rm", "-rf", path_arg.as_str()])
            .timeout(timeout)
            .capture(),
    )?;
    if !outcome.success() {
        warn!("could not remove directory {:?}", path);
    }

    Ok(())
}

/// Applies patch text with `git apply`, retrying with `--3way`. Returns whether either
/// strategy succeeded. Empty patch text applies trivially.
pub fn apply_patch(
    runner: &mut dyn CommandRunner,
    repo: &Path,
    patch: &str,
    label: &str,
) -> Result<bool> {
    if patch.trim().is_empty() {
        info!("no {} to apply (empty)", label);
        return Ok(true);
    }

    let mut file = tempfile::Builder::new()
        .prefix(&format!(".tmp_{}", label))
        .suffix(".patch")
        .tempfile()?;
    file.write_all(patch.as_bytes())?;
    file.flush()?;
    let patch_arg = file.path().to_string_lossy().into_owned();

    let plain_apply = git(repo, &["apply", "--verbose", &patch_arg], 60);
    let plain = runner.run(&plain_apply)?;
    fail_on_timeout(&plain_apply, &plain)?;
    if plain.success() {
        return Ok(true);
    }
    warn!(
        "git apply ({}) returned {:?}: {}",
        label,
        plain.code,
        plain.stderr.trim()
    );

    debug!("retrying {} with --3way", label);
    let three_way_apply = git(repo, &["apply", "--3way", &patch_arg], 60);
    let three_way = runner.run(&three_way_apply)?;
    fail_on_timeout(&three_way_apply, &three_way)?;
    if !three_way.success() {
        warn!(
            "git apply --3way ({}) also failed: {}",
            label,
            three_way.stderr.trim()
        );
        return Ok(false);
    }

    Ok(true)
}
