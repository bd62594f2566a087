//! Default namespace detection.
//!
//! Priority: explicit value, then `context.default_context`, then (only when
//! `context.context_from_cwd` is set) the repository name of the `origin`
//! remote of the enclosing git checkout, then the working directory's name.
//! Whatever wins is slugified.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::config::ContextConfig;
use crate::types::slugify;

/// Pick the namespace for a call.
#[must_use]
pub fn detect_context(explicit: Option<&str>, config: &ContextConfig, cwd: &Path) -> Option<String> {
    let chosen = explicit
        .filter(|s| !s.trim().is_empty())
        .map(str::to_string)
        .or_else(|| {
            config
                .default_context
                .clone()
                .filter(|s| !s.trim().is_empty())
        })
        .or_else(|| {
            if !config.context_from_cwd {
                return None;
            }
            git_origin_name(cwd).or_else(|| {
                cwd.file_name()
                    .map(|n| n.to_string_lossy().into_owned())
            })
        })?;
    let slug = slugify(&chosen);
    (!slug.is_empty()).then_some(slug)
}

/// Repository name of the `origin` remote, if `start` is inside a checkout.
#[must_use]
pub fn git_origin_name(start: &Path) -> Option<String> {
    let config = git_config_path(start)?;
    let text = fs::read_to_string(&config).ok()?;
    let url = origin_url(&text)?;
    let name = repo_name(&url);
    debug!(config = %config.display(), url = %url, name = ?name, "git origin");
    name
}

/// Locate the shared git config, following worktree `gitdir:` files.
fn git_config_path(start: &Path) -> Option<PathBuf> {
    for dir in start.ancestors() {
        let dot_git = dir.join(".git");
        if dot_git.is_dir() {
            return Some(dot_git.join("config"));
        }
        if dot_git.is_file() {
            let pointer = fs::read_to_string(&dot_git).ok()?;
            let gitdir = pointer.trim().strip_prefix("gitdir:")?.trim();
            let gitdir = dir.join(gitdir);
            let common = match fs::read_to_string(gitdir.join("commondir")) {
                Ok(rel) => gitdir.join(rel.trim()),
                Err(_) => gitdir,
            };
            return Some(common.join("config"));
        }
    }
    None
}

/// The `url` of `[remote "origin"]` in a git config file.
fn origin_url(config: &str) -> Option<String> {
    let mut in_origin = false;
    for line in config.lines().map(str::trim) {
        if line.starts_with('[') {
            in_origin = line == "[remote \"origin\"]";
            continue;
        }
        if in_origin {
            if let Some((key, value)) = line.split_once('=') {
                if key.trim() == "url" {
                    return Some(value.trim().to_string());
                }
            }
        }
    }
    None
}

/// `git@host:owner/repo.git` and `https://host/owner/repo` both give `repo`.
fn repo_name(url: &str) -> Option<String> {
    let url = url.trim();
    let url = url.strip_suffix(".git").unwrap_or(url);
    let path = if url.starts_with("git@") {
        url.split_once(':')?.1
    } else if let Some((_, rest)) = url.split_once("://") {
        rest
    } else {
        return None;
    };
    path.rsplit('/')
        .find(|s| !s.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repo_names_from_urls() {
        assert_eq!(repo_name("git@github.com:owner/recall.git").as_deref(), Some("recall"));
        assert_eq!(repo_name("https://github.com/owner/recall").as_deref(), Some("recall"));
        assert_eq!(repo_name("ssh://git@host/x/y.git").as_deref(), Some("y"));
        assert_eq!(repo_name("/srv/repos/local"), None);
    }

    #[test]
    fn origin_section_is_found() {
        let cfg = "[core]\n\tbare = false\n[remote \"upstream\"]\n\turl = git@h:o/up.git\n\
                   [remote \"origin\"]\n\turl = https://h/o/Main-Repo.git\n";
        assert_eq!(origin_url(cfg).as_deref(), Some("https://h/o/Main-Repo.git"));
    }

    #[test]
    fn priority_order() {
        let dir = tempfile::tempdir().expect("tempdir");
        let project = dir.path().join("My Project");
        fs::create_dir_all(project.join(".git")).expect("mkdir");
        fs::write(
            project.join(".git/config"),
            "[remote \"origin\"]\n\turl = git@github.com:me/Recall-Store.git\n",
        )
        .expect("write");

        let mut cfg = ContextConfig::default();
        assert_eq!(detect_context(None, &cfg, &project), None);
        assert_eq!(
            detect_context(Some("Explicit"), &cfg, &project).as_deref(),
            Some("explicit")
        );

        cfg.context_from_cwd = true;
        assert_eq!(
            detect_context(None, &cfg, &project.join("src")).as_deref(),
            Some("recall-store")
        );

        cfg.default_context = Some("team".into());
        assert_eq!(detect_context(None, &cfg, &project).as_deref(), Some("team"));
    }

    #[test]
    fn falls_back_to_directory_name() {
        let dir = tempfile::tempdir().expect("tempdir");
        let plain = dir.path().join("Plain Dir");
        fs::create_dir_all(&plain).expect("mkdir");
        let cfg = ContextConfig {
            default_context: None,
            context_from_cwd: true,
        };
        assert_eq!(detect_context(None, &cfg, &plain).as_deref(), Some("plain-dir"));
    }
}
