//! Project directory layout.
//!
//! Everything td persists lives under `./.todos/` in the working directory:
//! the database, the feature-flag file, and snapshot backups. Auth
//! credentials live in the user config directory instead, shared across
//! projects.

use std::path::{Path, PathBuf};

use td_core::{Error, Result};

/// Name of the per-project state directory.
pub const PROJECT_DIR: &str = ".todos";

/// Database file name inside the project directory.
pub const DB_FILE: &str = "issues.db";

/// Locate the project directory at or above `start`, walking up like git
/// does so subdirectory invocations find the same store.
#[must_use]
pub fn find_project_dir(start: &Path) -> Option<PathBuf> {
    let mut dir = Some(start);
    while let Some(d) = dir {
        let candidate = d.join(PROJECT_DIR);
        if candidate.is_dir() {
            return Some(candidate);
        }
        dir = d.parent();
    }
    None
}

/// The project directory for the current working directory.
///
/// # Errors
///
/// Returns `Error::NotFound` when no `.todos` directory exists here or above.
pub fn require_project_dir() -> Result<PathBuf> {
    let cwd = std::env::current_dir()?;
    find_project_dir(&cwd)
        .ok_or_else(|| Error::not_found("no .todos directory here; run 'td init' first"))
}

/// Create the project directory under `root` if missing.
///
/// # Errors
///
/// Returns `Error::Io` when the directory cannot be created.
pub fn init_project_dir(root: &Path) -> Result<PathBuf> {
    let dir = root.join(PROJECT_DIR);
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}

/// Path of the database file inside a project directory.
#[must_use]
pub fn db_path(project_dir: &Path) -> PathBuf {
    project_dir.join(DB_FILE)
}

/// Resolve the branch this invocation runs on.
///
/// `TD_BRANCH` wins; otherwise `.git/HEAD` next to the project directory is
/// read directly (git helpers are external collaborators, a symbolic-ref file
/// read is all the core needs). Detached heads use the short commit hash.
#[must_use]
pub fn current_branch(project_dir: &Path) -> String {
    if let Ok(branch) = std::env::var("TD_BRANCH") {
        if !branch.trim().is_empty() {
            return branch.trim().to_string();
        }
    }
    let head = project_dir
        .parent()
        .map(|root| root.join(".git").join("HEAD"))
        .and_then(|p| std::fs::read_to_string(p).ok());
    match head {
        Some(contents) => {
            let contents = contents.trim();
            contents.strip_prefix("ref: refs/heads/").map_or_else(
                || contents.chars().take(8).collect(),
                ToString::to_string,
            )
        }
        None => "main".to_string(),
    }
}
