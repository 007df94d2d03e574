//! Boundary validation for anything interpolated into a remote shell.

use std::path::{Component, Path, PathBuf};

use crate::error::{Result, StaxError};

/// Characters allowed in a remote shell argument.
fn allowed(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | '/' | '@' | '=')
}

/// Validate one argument against the allow-list and reject `..` segments.
pub fn check_token(arg: &str) -> Result<()> {
    if arg.is_empty() {
        return Err(StaxError::invalid("empty argument"));
    }
    if let Some(bad) = arg.chars().find(|c| !allowed(*c)) {
        return Err(StaxError::invalid(format!(
            "argument '{}' contains disallowed character {:?}",
            arg.escape_default(),
            bad
        )));
    }
    if arg.split('/').any(|seg| seg == "..") {
        return Err(StaxError::invalid(format!(
            "argument '{}' contains a '..' segment",
            arg
        )));
    }
    Ok(())
}

/// Validate every argument and join them into a remote command line.
pub fn command_line<S: AsRef<str>>(argv: &[S]) -> Result<String> {
    if argv.is_empty() {
        return Err(StaxError::invalid("empty command"));
    }
    for arg in argv {
        check_token(arg.as_ref())?;
    }
    Ok(argv
        .iter()
        .map(|a| a.as_ref())
        .collect::<Vec<_>>()
        .join(" "))
}

/// Join a relative path onto `root`, refusing anything that would leave it.
///
/// Rejects absolute paths and `..` components, and any existing symlink on
/// the way that resolves outside `root`.
pub fn safe_join(root: &Path, relative: &str) -> Result<PathBuf> {
    let rel = Path::new(relative);
    let mut out = root.to_path_buf();
    for component in rel.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            _ => {
                return Err(StaxError::invalid(format!(
                    "path '{}' escapes {}",
                    relative,
                    root.display()
                )));
            }
        }
    }

    let canonical_root = root.canonicalize().unwrap_or_else(|_| root.to_path_buf());
    let mut cursor = out.as_path();
    // Deepest existing ancestor decides whether a symlink leads outside.
    loop {
        if cursor.symlink_metadata().is_ok() {
            let resolved = cursor.canonicalize().map_err(|e| {
                StaxError::invalid(format!("cannot resolve {}: {}", cursor.display(), e))
            })?;
            if !resolved.starts_with(&canonical_root) {
                return Err(StaxError::invalid(format!(
                    "path '{}' resolves outside {}",
                    relative,
                    root.display()
                )));
            }
            break;
        }
        match cursor.parent() {
            Some(parent) if parent.starts_with(root) => cursor = parent,
            _ => break,
        }
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn accepts_ordinary_tokens() {
        for ok in [
            "wp",
            "--path=/home/wpe-user/sites/mysite",
            "db",
            "user@host",
            "a_b-c.d",
        ] {
            check_token(ok).unwrap();
        }
    }

    #[test]
    fn rejects_shell_metacharacters_and_traversal() {
        for bad in ["a;b", "$(id)", "a b", "x|y", "q'uote", "../etc", "a/../b", ""] {
            assert!(
                matches!(check_token(bad), Err(StaxError::InvalidArgument(_))),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn safe_join_stays_inside_root() {
        let dir = tempfile::tempdir().unwrap();
        let joined = safe_join(dir.path(), "uploads/2024/a.jpg").unwrap();
        assert!(joined.starts_with(dir.path()));
        assert!(safe_join(dir.path(), "../outside").is_err());
        assert!(safe_join(dir.path(), "/etc/passwd").is_err());
    }

    #[cfg(unix)]
    #[test]
    fn safe_join_rejects_symlink_escape() {
        let root = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink(outside.path(), root.path().join("link")).unwrap();
        assert!(safe_join(root.path(), "link/file.txt").is_err());
    }

    proptest! {
        #[test]
        fn any_disallowed_char_is_refused(prefix in "[a-z]{0,4}", bad in "[^A-Za-z0-9._/@=-]", suffix in "[a-z]{0,4}") {
            let arg = format!("{prefix}{bad}{suffix}");
            prop_assert!(command_line(&["wp", arg.as_str()]).is_err());
        }
    }
}
