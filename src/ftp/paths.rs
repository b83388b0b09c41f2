use std::path::{Component, Path, PathBuf};

/// A leading separator means the argument is absolute, anything else is
/// joined to `cwd`. Purely lexical, like the original server's path
/// handling: no symlink resolution, no filesystem access.
pub fn resolve(cwd: &Path, arg: &str) -> PathBuf {
    let arg = arg.replace('\\', "/");

    let joined = if arg.starts_with('/') {
        PathBuf::from(&arg)
    } else {
        cwd.join(&arg)
    };

    normalize(&joined)
}

/// `..` pops, `.` disappears, and the result always starts at the root.
pub fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::from("/");

    for component in path.components() {
        match component {
            Component::RootDir | Component::Prefix(_) | Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            Component::Normal(name) => out.push(name),
        }
    }

    out
}

/// Forward-slash rendering for replies.
pub fn display(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absolute_arguments_ignore_the_cwd() {
        let cwd = PathBuf::from("/srv/ftp");

        assert_eq!(resolve(&cwd, "/etc/passwd"), PathBuf::from("/etc/passwd"));
    }

    #[test]
    fn relative_arguments_join_the_cwd() {
        let cwd = PathBuf::from("/srv/ftp");

        assert_eq!(resolve(&cwd, "files/a.txt"), PathBuf::from("/srv/ftp/files/a.txt"));
        assert_eq!(resolve(&cwd, ""), cwd);
    }

    #[test]
    fn dot_dot_resolves_lexically() {
        let cwd = PathBuf::from("/srv/ftp");

        assert_eq!(resolve(&cwd, ".."), PathBuf::from("/srv"));
        assert_eq!(resolve(&cwd, "../../.."), PathBuf::from("/"));
        assert_eq!(resolve(&cwd, "./a/../b"), PathBuf::from("/srv/ftp/b"));
    }

    #[test]
    fn backslashes_fold_to_forward_slashes() {
        let cwd = PathBuf::from("/srv");

        assert_eq!(resolve(&cwd, "a\\b.txt"), PathBuf::from("/srv/a/b.txt"));
    }
}
