use std::fs;
use std::io::Write;

use camino::Utf8Path;

use crate::error::ConnError;

pub fn write_atomic(path: &Utf8Path, content: &[u8]) -> Result<(), ConnError> {
    let parent = path
        .parent()
        .filter(|parent| !parent.as_str().is_empty())
        .unwrap_or(Utf8Path::new("."));
    fs::create_dir_all(parent).map_err(|err| ConnError::Filesystem(err.to_string()))?;
    let mut temp = tempfile::Builder::new()
        .prefix(".conn-pipeline")
        .tempfile_in(parent)
        .map_err(|err| ConnError::Filesystem(err.to_string()))?;
    temp.write_all(content)
        .map_err(|err| ConnError::Filesystem(err.to_string()))?;
    temp.persist(path)
        .map_err(|err| ConnError::Filesystem(format!("persist {path}: {}", err.error)))?;
    Ok(())
}

pub fn replace_in_file(
    path: &Utf8Path,
    replacements: &[(String, String)],
) -> Result<bool, ConnError> {
    rewrite_file(path, |content| {
        replacements
            .iter()
            .fold(content.to_string(), |acc, (from, to)| acc.replace(from.as_str(), to))
    })
}

/// Rewrites a text file through `edit`, touching the file only when the
/// content changed. Returns whether the file was rewritten.
pub fn rewrite_file(path: &Utf8Path, edit: impl FnOnce(&str) -> String) -> Result<bool, ConnError> {
    let original = fs::read_to_string(path)
        .map_err(|err| ConnError::Filesystem(format!("read {path}: {err}")))?;
    let content = edit(&original);
    if content == original {
        return Ok(false);
    }
    fs::write(path, content)
        .map_err(|err| ConnError::Filesystem(format!("write {path}: {err}")))?;
    Ok(true)
}

pub fn move_file(from: &Utf8Path, to: &Utf8Path) -> Result<(), ConnError> {
    if fs::rename(from, to).is_ok() {
        return Ok(());
    }
    fs::copy(from, to)
        .map_err(|err| ConnError::Filesystem(format!("copy {from} -> {to}: {err}")))?;
    fs::remove_file(from)
        .map_err(|err| ConnError::Filesystem(format!("remove {from}: {err}")))?;
    Ok(())
}
