//! Path sanitization shared by file-op tools and the Kubernetes pod-exec
//! file operations.

use std::path::{Component, Path, PathBuf};

/// Strip `..` parent-dir components and any leading root, leaving a path
/// safe to join under a project root. This implements the "reject `..`
/// traversal by stripping the sequence" rule from the tool-registry
/// contract (§4.C) and the Kubernetes file-op path sanitation rule (§4.H-K).
pub fn sanitize_relative_path(input: &str) -> String {
    let path = Path::new(input);
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {}
            Component::CurDir => {}
            Component::Normal(part) => out.push(part),
        }
    }
    out.to_string_lossy().into_owned()
}

/// Join a sanitized relative path onto a workspace root, guaranteeing the
/// result stays inside `root` even if the caller didn't pre-sanitize.
pub fn join_within(root: &Path, relative: &str) -> PathBuf {
    root.join(sanitize_relative_path(relative))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_parent_dir_sequences() {
        assert_eq!(sanitize_relative_path("../../etc/passwd"), "etc/passwd");
        assert_eq!(sanitize_relative_path("a/../../b"), "a/b");
    }

    #[test]
    fn strips_leading_root() {
        assert_eq!(sanitize_relative_path("/etc/passwd"), "etc/passwd");
    }

    #[test]
    fn leaves_normal_paths_untouched() {
        assert_eq!(sanitize_relative_path("src/main.rs"), "src/main.rs");
    }

    #[test]
    fn join_within_stays_under_root() {
        let root = Path::new("/app");
        assert_eq!(join_within(root, "../../x"), Path::new("/app/x"));
    }
}
