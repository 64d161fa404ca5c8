use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;
use walkdir::{DirEntry, WalkDir};

use crate::error::ConnError;
use crate::output::{ProgressEvent, ProgressSink};
use crate::paths;

const EXCLUDED_DIR: &str = "preprocessing";
const EXCLUDED_EXTENSION: &str = ".nii";
const DATA_DIR: &str = "data";
const EXCLUDED_DATA_PREFIXES: [&str; 3] = ["DATA_Subject", "VV_DATA_", "BA_Subject"];

#[derive(Debug, Clone, Serialize)]
pub struct ExportReport {
    pub project_file: Utf8PathBuf,
    pub destination: Utf8PathBuf,
    pub files_copied: usize,
    pub bytes_copied: u64,
}

pub fn export_light(
    project_mat: &Utf8Path,
    dest_dir: &Utf8Path,
    sink: &dyn ProgressSink,
) -> Result<ExportReport, ConnError> {
    let project_mat = paths::normalize(project_mat)?;
    let dest_dir = paths::normalize(dest_dir)?;
    paths::require_file("CONN project file", &project_mat)?;

    let project_name = project_mat.file_stem().unwrap_or_default().to_string();
    let project_dir = project_mat
        .parent()
        .unwrap_or(Utf8Path::new("/"))
        .join(&project_name);
    paths::require_dir("CONN project directory", &project_dir)?;

    sink.event(ProgressEvent::info(format!(
        "--- Starting Lightweight Export of CONN Project: {project_name} ---"
    )));
    fs::create_dir_all(&dest_dir)
        .map_err(|err| ConnError::Filesystem(format!("create {dest_dir}: {err}")))?;

    sink.event(ProgressEvent::info("Copying project file..."));
    let copied_mat = dest_dir.join(paths::file_name(&project_mat));
    let mut bytes_copied = copy_file(&project_mat, &copied_mat)?;
    let mut files_copied = 1;

    sink.event(ProgressEvent::info("Syncing results and ROI data..."));
    let dest_project = dest_dir.join(&project_name);
    if dest_project.exists() {
        sink.event(ProgressEvent::warning(
            "Destination project folder already exists. Overwriting...",
        ));
        fs::remove_dir_all(&dest_project)
            .map_err(|err| ConnError::Filesystem(format!("remove {dest_project}: {err}")))?;
    }
    fs::create_dir_all(&dest_project)
        .map_err(|err| ConnError::Filesystem(format!("create {dest_project}: {err}")))?;

    let walker = WalkDir::new(&project_dir)
        .min_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| !is_excluded(entry));
    for entry in walker {
        let entry = entry.map_err(|err| ConnError::Filesystem(err.to_string()))?;
        let source = paths::to_utf8(entry.into_path())?;
        let Ok(relative) = source.strip_prefix(&project_dir) else {
            continue;
        };
        let target = dest_project.join(relative);
        if source.is_dir() {
            fs::create_dir_all(&target)
                .map_err(|err| ConnError::Filesystem(format!("create {target}: {err}")))?;
        } else {
            bytes_copied += copy_file(&source, &target)?;
            files_copied += 1;
        }
    }

    sink.event(ProgressEvent::success("--- Export Complete ---"));
    Ok(ExportReport {
        project_file: copied_mat,
        destination: dest_project,
        files_copied,
        bytes_copied,
    })
}

fn is_excluded(entry: &DirEntry) -> bool {
    let Some(name) = entry.file_name().to_str() else {
        return false;
    };
    if name == EXCLUDED_DIR || name.ends_with(EXCLUDED_EXTENSION) {
        return true;
    }
    let in_data_dir = entry.depth() == 2
        && entry
            .path()
            .parent()
            .and_then(|parent| parent.file_name())
            .is_some_and(|parent| parent == DATA_DIR);
    in_data_dir
        && EXCLUDED_DATA_PREFIXES
            .iter()
            .any(|prefix| name.starts_with(prefix))
}

fn copy_file(from: &Utf8Path, to: &Utf8Path) -> Result<u64, ConnError> {
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent)
            .map_err(|err| ConnError::Filesystem(format!("create {parent}: {err}")))?;
    }
    fs::copy(from, to).map_err(|err| ConnError::Filesystem(format!("copy {from} -> {to}: {err}")))
}
