//! Git transport for feedstock working copies.
//!
//! Wraps the handful of plumbing operations the pipeline needs: cloning,
//! fetching a PR head, capturing a unified diff against a recorded
//! commit, re-applying that diff on the trusted side, committing, and
//! pushing. Working copies are process-local scratch space and are
//! scrubbed before the sandboxed phase exits.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use git2::build::{CheckoutBuilder, RepoBuilder};
use git2::{
    ApplyLocation, Cred, Diff, DiffFormat, DiffOptions, IndexAddOption, PushOptions,
    RemoteCallbacks, Repository, Signature,
};

/// A cloned feedstock working copy.
pub struct FeedstockClone {
    repo: Repository,
    dir: PathBuf,
}

impl FeedstockClone {
    /// Clone the default branch of `url` into `dir`.
    pub fn clone(url: &str, dir: &Path) -> Result<Self> {
        let repo = Repository::clone(url, dir)
            .with_context(|| format!("Failed to clone {url}"))?;
        Ok(Self {
            repo,
            dir: dir.to_path_buf(),
        })
    }

    /// Clone a specific branch of `url` into `dir`.
    pub fn clone_branch(url: &str, dir: &Path, branch: &str) -> Result<Self> {
        let repo = RepoBuilder::new()
            .branch(branch)
            .clone(url, dir)
            .with_context(|| format!("Failed to clone {url} at branch {branch}"))?;
        Ok(Self {
            repo,
            dir: dir.to_path_buf(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Fetch `pull/<n>/head` from origin into a local branch of the same
    /// name and check it out.
    pub fn checkout_pr_head(&self, pr_number: u64) -> Result<()> {
        let refspec = format!("+refs/pull/{pr_number}/head:refs/heads/pull/{pr_number}/head");
        let mut remote = self
            .repo
            .find_remote("origin")
            .context("Working copy has no origin remote")?;
        remote
            .fetch(&[refspec.as_str()], None, None)
            .with_context(|| format!("Failed to fetch pull/{pr_number}/head"))?;

        self.repo
            .set_head(&format!("refs/heads/pull/{pr_number}/head"))?;
        self.repo
            .checkout_head(Some(CheckoutBuilder::new().force()))
            .with_context(|| format!("Failed to check out pull/{pr_number}/head"))?;
        Ok(())
    }

    /// Current HEAD commit SHA.
    pub fn head_sha(&self) -> Result<String> {
        let head = self.repo.head()?.peel_to_commit()?;
        Ok(head.id().to_string())
    }

    /// Unified diff of the working tree (untracked files included)
    /// against the given commit. `None` when nothing changed.
    pub fn patch_relative_to(&self, commit_sha: &str) -> Result<Option<String>> {
        let oid = git2::Oid::from_str(commit_sha)?;
        let tree = self.repo.find_commit(oid)?.tree()?;

        let mut opts = DiffOptions::new();
        opts.include_untracked(true)
            .recurse_untracked_dirs(true)
            .show_untracked_content(true);

        let diff = self
            .repo
            .diff_tree_to_workdir_with_index(Some(&tree), Some(&mut opts))?;

        let mut buf = Vec::new();
        diff.print(DiffFormat::Patch, |_delta, _hunk, line| {
            match line.origin() {
                '+' | '-' | ' ' => buf.push(line.origin() as u8),
                _ => {}
            }
            buf.extend_from_slice(line.content());
            true
        })?;

        if buf.is_empty() {
            Ok(None)
        } else {
            Ok(Some(String::from_utf8_lossy(&buf).to_string()))
        }
    }

    /// Apply a unified diff to the working tree. An empty patch is a
    /// valid no-op: "ran but produced no content change".
    pub fn apply_patch(&self, patch: &str) -> Result<()> {
        if patch.trim().is_empty() {
            return Ok(());
        }
        let diff = Diff::from_buffer(patch.as_bytes()).context("Patch is not a valid diff")?;
        self.repo
            .apply(&diff, ApplyLocation::WorkDir, None)
            .context("Patch did not apply cleanly")?;
        Ok(())
    }

    /// Stage every path in the working tree, untracked files included.
    pub fn stage_all(&self) -> Result<()> {
        let mut index = self.repo.index()?;
        index.add_all(["*"].iter(), IndexAddOption::FORCE, None)?;
        index.write()?;
        Ok(())
    }

    /// Commit the index onto HEAD. An empty commit (no tree delta) is
    /// allowed: one Task Result always maps to exactly one commit.
    pub fn commit(&self, message: &str) -> Result<String> {
        let mut index = self.repo.index()?;
        let tree_id = index.write_tree()?;
        let tree = self.repo.find_tree(tree_id)?;
        let parent = self.repo.head()?.peel_to_commit()?;
        let sig = Signature::now("stoker", "stoker@localhost")?;

        let commit_id = self
            .repo
            .commit(Some("HEAD"), &sig, &sig, message, &tree, &[&parent])?;
        Ok(commit_id.to_string())
    }

    /// Push HEAD to `branch` on origin, authenticating with `token`.
    pub fn push(&self, branch: &str, token: &str) -> Result<()> {
        let mut remote = self
            .repo
            .find_remote("origin")
            .context("Working copy has no origin remote")?;

        let mut callbacks = RemoteCallbacks::new();
        callbacks.credentials(|_url, _username, _allowed| {
            Cred::userpass_plaintext("x-access-token", token)
        });
        let mut options = PushOptions::new();
        options.remote_callbacks(callbacks);

        let refspec = format!("refs/heads/{branch}:refs/heads/{branch}");
        remote
            .push(&[refspec.as_str()], Some(&mut options))
            .with_context(|| format!("Failed to push to {branch}"))?;
        Ok(())
    }

    /// Remove the `.git` directory, then the working copy itself. The
    /// sandbox must leave no residue behind.
    pub fn scrub(self) -> Result<()> {
        let Self { repo, dir } = self;
        drop(repo);
        let git_dir = dir.join(".git");
        if git_dir.exists() {
            fs::remove_dir_all(&git_dir)
                .with_context(|| format!("Failed to remove {}", git_dir.display()))?;
        }
        fs::remove_dir_all(&dir).with_context(|| format!("Failed to remove {}", dir.display()))?;
        Ok(())
    }
}
