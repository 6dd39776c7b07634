#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **wasync-store** – Capability interface to a version-controlled working
//! tree, plus a concrete git-backed implementation.
//!
//! The [`VersionedStore`] trait is the Synchronizer's only way to persist a
//! fetched payload and publish it upstream. [`GitStore`] implements it over
//! a local git working tree using `git2`, generalizing the upstream's own
//! `Gitworker` shell-out-to-`git`-via-library discipline: objects land on
//! disk as pretty-printed JSON named by identifier alone, are staged into
//! the git index, and are committed with a caller-supplied title and body
//! before the branch is pushed to its configured remote over a dedicated
//! SSH key.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use git2::{Cred, PushOptions, RemoteCallbacks, Repository, Signature};
use thiserror::Error;
use tracing::{debug, info};

use wasync_types::{Identifier, Payload};

/// Errors raised by [`VersionedStore`] operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The working tree could not be opened as a git repository.
    #[error("failed to open git working tree at {path}: {source}")]
    Open {
        /// The working tree path.
        path: PathBuf,
        /// The underlying libgit2 error.
        #[source]
        source: git2::Error,
    },
    /// The repository failed a precondition check (missing remote, branch
    /// that cannot be checked out) before any object was written.
    #[error("working tree validation failed: {0}")]
    Validation(String),
    /// Writing a payload file to the working tree failed.
    #[error("failed to write object file at {path}: {source}")]
    Io {
        /// The file path involved.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: io::Error,
    },
    /// A libgit2 operation (checkout, stage, commit, push) failed.
    #[error("git operation '{operation}' failed: {source}")]
    Git {
        /// A short name for the failing operation, for log correlation.
        operation: &'static str,
        /// The underlying libgit2 error.
        #[source]
        source: git2::Error,
    },
    /// Pushing the branch to its remote failed.
    #[error("failed to publish to remote '{remote}': {reason}")]
    Publish {
        /// The remote name.
        remote: String,
        /// Why the push was rejected.
        reason: String,
    },
}

/// Result alias for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Capability interface to a version-controlled working tree.
///
/// Mirrors spec §4.4 exactly: `checkout`, `stage`, `commit`, `publish`.
/// Implementations are free to batch staged writes however they like;
/// [`VersionedStore::commit`] is the unit of durability the Synchronizer
/// relies on — once it returns `Ok(Some(_))`, everything staged so far is
/// committed to history, independent of later writes failing.
pub trait VersionedStore: Send {
    /// The working tree root objects are written beneath.
    fn working_tree(&self) -> &Path;

    /// Ensure the working tree is on `branch` (default `main`), creating it
    /// from the current HEAD if it does not yet exist. Called once before
    /// any writes in a run.
    fn checkout(&mut self, branch: &str) -> Result<()>;

    /// Validate the store is otherwise usable: the configured remote
    /// exists. Called once after [`VersionedStore::checkout`].
    fn validate(&self) -> Result<()>;

    /// Serialize `payload` as pretty-printed JSON (2-space indent) to
    /// `<working_tree>/<id>` and stage it into the index. Does not commit.
    fn write_object(&mut self, id: &Identifier, payload: &Payload) -> Result<()>;

    /// Idempotently stage an already-written file at `relative_path`
    /// (relative to [`VersionedStore::working_tree`]) into the index
    /// without touching its contents. Used for registry files the
    /// Synchronizer writes directly through `wasync-registry`.
    fn stage(&mut self, relative_path: &Path) -> Result<()>;

    /// Commit everything currently staged under `title` with a (possibly
    /// multi-line) `body`. Returns `Ok(None)` if nothing was staged (the
    /// index matches `HEAD`'s tree) rather than creating an empty commit.
    fn commit(&mut self, title: &str, body: &str) -> Result<Option<String>>;

    /// Push the current branch to its configured remote using the
    /// configured transport credential.
    fn publish(&mut self) -> Result<()>;
}

/// A [`VersionedStore`] backed by a local git working tree.
pub struct GitStore {
    repo: Repository,
    working_tree: PathBuf,
    ssh_key_path: PathBuf,
    ssh_user: String,
    remote_name: String,
    author: String,
    author_email: String,
}

impl GitStore {
    /// Open an existing git working tree. The repository must already be
    /// cloned; this type does not clone or configure a remote.
    pub fn open(
        working_tree: impl Into<PathBuf>,
        ssh_key_path: impl Into<PathBuf>,
        remote_name: impl Into<String>,
    ) -> Result<Self> {
        let working_tree = working_tree.into();
        let repo = Repository::open(&working_tree).map_err(|source| StoreError::Open {
            path: working_tree.clone(),
            source,
        })?;
        Ok(Self {
            repo,
            working_tree,
            ssh_key_path: ssh_key_path.into(),
            ssh_user: "git".to_string(),
            remote_name: remote_name.into(),
            author: "wasync".to_string(),
            author_email: "wasync@localhost".to_string(),
        })
    }

    /// Override the commit author identity (defaults to `wasync
    /// <wasync@localhost>`).
    pub fn with_author(mut self, name: impl Into<String>, email: impl Into<String>) -> Self {
        self.author = name.into();
        self.author_email = email.into();
        self
    }

    fn object_path(&self, id: &Identifier) -> PathBuf {
        self.working_tree.join(id.as_str())
    }

    fn relative_path<'a>(&self, absolute: &'a Path) -> PathBuf {
        absolute
            .strip_prefix(&self.working_tree)
            .unwrap_or(absolute)
            .to_path_buf()
    }

    fn remote_callbacks(&self) -> RemoteCallbacks<'_> {
        let mut callbacks = RemoteCallbacks::new();
        let ssh_key_path = self.ssh_key_path.clone();
        let ssh_user = self.ssh_user.clone();
        callbacks.credentials(move |_url, username_from_url, _allowed| {
            Cred::ssh_key(username_from_url.unwrap_or(&ssh_user), None, &ssh_key_path, None)
        });
        callbacks
    }
}

impl VersionedStore for GitStore {
    fn working_tree(&self) -> &Path {
        &self.working_tree
    }

    fn checkout(&mut self, branch: &str) -> Result<()> {
        let refname = format!("refs/heads/{branch}");
        if self.repo.find_reference(&refname).is_err() {
            let head = self
                .repo
                .head()
                .map_err(|source| StoreError::Git { operation: "head", source })?;
            let commit = head
                .peel_to_commit()
                .map_err(|source| StoreError::Git { operation: "peel_head", source })?;
            self.repo
                .branch(branch, &commit, false)
                .map_err(|source| StoreError::Git { operation: "create_branch", source })?;
        }
        self.repo
            .set_head(&refname)
            .map_err(|source| StoreError::Git { operation: "set_head", source })?;
        self.repo
            .checkout_head(None)
            .map_err(|source| StoreError::Git { operation: "checkout_head", source })?;
        debug!(branch, "working tree on branch");
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        self.repo
            .find_remote(&self.remote_name)
            .map_err(|_| StoreError::Validation(format!("remote '{}' is not configured", self.remote_name)))?;
        debug!(remote = %self.remote_name, "working tree validated");
        Ok(())
    }

    fn write_object(&mut self, id: &Identifier, payload: &Payload) -> Result<()> {
        let path = self.object_path(id);
        let pretty =
            serde_json::to_string_pretty(payload).expect("serializing a serde_json::Value is infallible");
        fs::write(&path, pretty).map_err(|source| StoreError::Io { path: path.clone(), source })?;

        let relative = self.relative_path(&path);
        self.stage(&relative)?;
        debug!(%id, path = %relative.display(), "object written and staged");
        Ok(())
    }

    fn stage(&mut self, relative_path: &Path) -> Result<()> {
        let mut index = self
            .repo
            .index()
            .map_err(|source| StoreError::Git { operation: "open_index", source })?;
        index
            .add_path(relative_path)
            .map_err(|source| StoreError::Git { operation: "stage", source })?;
        index
            .write()
            .map_err(|source| StoreError::Git { operation: "write_index", source })?;
        Ok(())
    }

    fn commit(&mut self, title: &str, body: &str) -> Result<Option<String>> {
        let mut index = self
            .repo
            .index()
            .map_err(|source| StoreError::Git { operation: "open_index", source })?;
        let tree_oid = index
            .write_tree()
            .map_err(|source| StoreError::Git { operation: "write_tree", source })?;
        let tree = self
            .repo
            .find_tree(tree_oid)
            .map_err(|source| StoreError::Git { operation: "find_tree", source })?;

        let head = self
            .repo
            .head()
            .map_err(|source| StoreError::Git { operation: "head", source })?;
        let parent = head
            .peel_to_commit()
            .map_err(|source| StoreError::Git { operation: "peel_head", source })?;

        if parent.tree_id() == tree_oid {
            debug!(title, "nothing staged, skipping empty commit");
            return Ok(None);
        }

        let message = if body.is_empty() {
            format!("{title}\n")
        } else {
            format!("{title}\n\n{body}")
        };

        let signature = Signature::now(&self.author, &self.author_email)
            .map_err(|source| StoreError::Git { operation: "signature", source })?;

        let oid = self
            .repo
            .commit(Some("HEAD"), &signature, &signature, &message, &tree, &[&parent])
            .map_err(|source| StoreError::Git { operation: "commit", source })?;

        info!(title, commit = %oid, "committed");
        Ok(Some(oid.to_string()))
    }

    fn publish(&mut self) -> Result<()> {
        let branch = {
            let head = self
                .repo
                .head()
                .map_err(|source| StoreError::Git { operation: "head", source })?;
            head.shorthand().unwrap_or("main").to_string()
        };

        let mut remote = self
            .repo
            .find_remote(&self.remote_name)
            .map_err(|source| StoreError::Git { operation: "find_remote", source })?;

        let refspec = format!("refs/heads/{branch}:refs/heads/{branch}");
        let mut options = PushOptions::new();
        options.remote_callbacks(self.remote_callbacks());

        remote.push(&[refspec], Some(&mut options)).map_err(|e| StoreError::Publish {
            remote: self.remote_name.clone(),
            reason: e.to_string(),
        })?;

        info!(remote = %self.remote_name, branch, "pushed");
        Ok(())
    }
}
