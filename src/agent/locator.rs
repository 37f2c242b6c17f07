//! Locate the first runnable candidate of a [`LaunchAgentSpec`].

use std::ffi::OsStr;
use std::path::{Path, PathBuf};

use super::types::{LaunchAgentSpec, ResolvedAgent};

/// Resolve the first candidate whose executable can be found.
///
/// `search_path` overrides the process `PATH` (a `:`-separated directory
/// list); `cwd` anchors relative names and relative search-path entries.
/// Candidates after the first hit are never tried. Returns `None` when no
/// candidate resolves, which callers decide how to treat.
pub fn resolve(
    spec: &LaunchAgentSpec,
    search_path: Option<&OsStr>,
    cwd: &Path,
) -> Option<ResolvedAgent> {
    if spec.is_empty() {
        return None;
    }
    let path_var = match search_path {
        Some(p) => Some(p.to_os_string()),
        None => std::env::var_os("PATH"),
    };
    resolve_with(spec, |name| {
        find_executable(name, path_var.as_deref(), cwd)
    })
}

/// Walk the candidates with a custom lookup function.
///
/// `lookup` receives each candidate's first token and returns the absolute
/// path if it is runnable.
pub fn resolve_with<F>(spec: &LaunchAgentSpec, mut lookup: F) -> Option<ResolvedAgent>
where
    F: FnMut(&str) -> Option<PathBuf>,
{
    for candidate in spec.candidates() {
        let tokens: Vec<&str> = candidate.split_whitespace().collect();
        let Some(program) = tokens.first() else {
            continue;
        };
        match lookup(program) {
            Some(path) => {
                tracing::debug!(candidate = %candidate, path = %path.display(), "Launch agent resolved");
                return Some(ResolvedAgent::from_candidate(path, &tokens));
            }
            None => {
                tracing::debug!(candidate = %candidate, "Launch agent candidate not found");
            }
        }
    }
    None
}

/// Find `name` as an executable file.
///
/// Absolute names are checked directly, names containing a `/` are resolved
/// against `cwd`, and bare names are searched in each entry of `search_path`.
pub fn find_executable(name: &str, search_path: Option<&OsStr>, cwd: &Path) -> Option<PathBuf> {
    let candidate = Path::new(name);
    if candidate.is_absolute() {
        return is_executable(candidate).then(|| candidate.to_path_buf());
    }
    if name.contains('/') {
        let joined = cwd.join(candidate);
        return is_executable(&joined).then_some(joined);
    }

    let search_path = search_path.filter(|p| !p.is_empty())?;
    for dir in std::env::split_paths(search_path) {
        // Empty and relative PATH entries refer to the working directory.
        let dir = if dir.as_os_str().is_empty() {
            cwd.to_path_buf()
        } else if dir.is_relative() {
            cwd.join(dir)
        } else {
            dir
        };
        let full = dir.join(name);
        if is_executable(&full) {
            return Some(full);
        }
    }
    None
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    match std::fs::metadata(path) {
        Ok(meta) => meta.is_file() && meta.permissions().mode() & 0o111 != 0,
        Err(_) => false,
    }
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::types::Mechanism;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn make_exe(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, "#!/bin/sh\nexit 0\n").unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[test]
    fn first_found_candidate_wins() {
        let tmp = TempDir::new().unwrap();
        make_exe(tmp.path(), "rsh");
        make_exe(tmp.path(), "ssh");

        let spec = LaunchAgentSpec::parse("ssh -q : rsh");
        let agent = resolve(&spec, Some(tmp.path().as_os_str()), tmp.path()).unwrap();
        assert_eq!(agent.argv, ["ssh", "-q"]);
        assert_eq!(agent.path, tmp.path().join("ssh"));
        assert_eq!(agent.mechanism, Mechanism::SshFamily);
    }

    #[test]
    fn skips_missing_candidates() {
        let tmp = TempDir::new().unwrap();
        make_exe(tmp.path(), "rsh");

        let spec = LaunchAgentSpec::parse("ssh : rsh");
        let agent = resolve(&spec, Some(tmp.path().as_os_str()), tmp.path()).unwrap();
        assert_eq!(agent.argv, ["rsh"]);
        assert_eq!(agent.mechanism, Mechanism::RshFamily);
    }

    #[test]
    fn candidates_after_a_match_are_never_tried() {
        let spec = LaunchAgentSpec::parse("a : b : c : d");
        let mut tried = Vec::new();
        let agent = resolve_with(&spec, |name| {
            tried.push(name.to_string());
            (name == "b").then(|| PathBuf::from("/opt/bin/b"))
        });
        assert_eq!(agent.unwrap().argv, ["b"]);
        assert_eq!(tried, ["a", "b"]);
    }

    #[test]
    fn empty_spec_never_calls_lookup() {
        let spec = LaunchAgentSpec::parse(" : ");
        let agent = resolve_with(&spec, |_| panic!("lookup must not run"));
        assert!(agent.is_none());
        assert!(resolve(&spec, None, Path::new("/")).is_none());
    }

    #[test]
    fn non_executable_file_is_not_a_match() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("ssh"), "not executable").unwrap();

        let spec = LaunchAgentSpec::parse("ssh");
        assert!(resolve(&spec, Some(tmp.path().as_os_str()), tmp.path()).is_none());
    }

    #[test]
    fn absolute_candidate_is_checked_directly() {
        let tmp = TempDir::new().unwrap();
        let exe = make_exe(tmp.path(), "launcher");

        let spec = LaunchAgentSpec::parse(&format!("{} --fast", exe.display()));
        let agent = resolve(&spec, Some(OsStr::new("")), Path::new("/")).unwrap();
        assert_eq!(agent.argv, ["launcher", "--fast"]);
        assert_eq!(agent.path, exe);
        assert_eq!(agent.mechanism, Mechanism::UserDefined);
    }

    #[test]
    fn relative_search_path_entries_resolve_against_cwd() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir(tmp.path().join("bin")).unwrap();
        make_exe(&tmp.path().join("bin"), "ssh");

        let found = find_executable("ssh", Some(OsStr::new("bin")), tmp.path());
        assert_eq!(found, Some(tmp.path().join("bin").join("ssh")));
    }

    #[test]
    fn slash_names_resolve_against_cwd() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir(tmp.path().join("tools")).unwrap();
        make_exe(&tmp.path().join("tools"), "rsh");

        let found = find_executable("tools/rsh", None, tmp.path());
        assert_eq!(found, Some(tmp.path().join("tools/rsh")));
    }
}
