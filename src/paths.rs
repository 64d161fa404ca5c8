use std::path::{Component, Path, PathBuf};

use camino::{Utf8Path, Utf8PathBuf};
use directories::BaseDirs;

use crate::error::ConnError;

/// Lexical only: `~` is expanded and `..` pops a component, but the path
/// does not need to exist and symlinks are not resolved.
pub fn normalize(path: impl AsRef<Path>) -> Result<Utf8PathBuf, ConnError> {
    let expanded = expand_home(path.as_ref())?;
    let absolute = if expanded.is_absolute() {
        expanded
    } else {
        std::env::current_dir()
            .map_err(|err| ConnError::Filesystem(err.to_string()))?
            .join(expanded)
    };
    to_utf8(clean(&absolute))
}

pub fn to_utf8(path: PathBuf) -> Result<Utf8PathBuf, ConnError> {
    Utf8PathBuf::from_path_buf(path)
        .map_err(|path| ConnError::NonUtf8Path(path.to_string_lossy().to_string()))
}

pub fn home_dir() -> Option<Utf8PathBuf> {
    BaseDirs::new().and_then(|dirs| Utf8PathBuf::from_path_buf(dirs.home_dir().to_path_buf()).ok())
}

pub fn file_name(path: &Utf8Path) -> &str {
    path.file_name().unwrap_or_default()
}

pub fn require_dir(kind: &'static str, path: &Utf8Path) -> Result<(), ConnError> {
    if path.is_dir() {
        Ok(())
    } else {
        Err(ConnError::PathNotFound {
            kind,
            path: path.to_owned(),
        })
    }
}

pub fn require_file(kind: &'static str, path: &Utf8Path) -> Result<(), ConnError> {
    if path.is_file() {
        Ok(())
    } else {
        Err(ConnError::PathNotFound {
            kind,
            path: path.to_owned(),
        })
    }
}

fn expand_home(path: &Path) -> Result<PathBuf, ConnError> {
    let mut components = path.components();
    match components.next() {
        Some(Component::Normal(first)) if first == "~" => {
            let home = BaseDirs::new()
                .map(|dirs| dirs.home_dir().to_path_buf())
                .ok_or_else(|| {
                    ConnError::Filesystem("unable to resolve home directory".to_string())
                })?;
            Ok(home.join(components.as_path()))
        }
        _ => Ok(path.to_path_buf()),
    }
}

fn clean(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match out.components().next_back() {
                Some(Component::Normal(_)) => {
                    out.pop();
                }
                Some(Component::RootDir) | Some(Component::Prefix(_)) => {}
                _ => out.push(component),
            },
            other => out.push(other),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_trailing_separator_and_dots() {
        let path = normalize("/data/./bids/sub-01/../").unwrap();
        assert_eq!(path, Utf8PathBuf::from("/data/bids"));
    }

    #[test]
    fn relative_paths_become_absolute() {
        let path = normalize("project").unwrap();
        assert!(path.is_absolute());
        assert!(path.ends_with("project"));
    }

    #[test]
    fn parent_of_root_stays_at_root() {
        let path = normalize("/../data").unwrap();
        assert_eq!(path, Utf8PathBuf::from("/data"));
    }
}
