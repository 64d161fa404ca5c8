use std::collections::BTreeSet;
use std::fs;
use std::sync::LazyLock;

use camino::Utf8Path;
use regex::Regex;
use serde::Serialize;
use walkdir::WalkDir;

use crate::error::ConnError;
use crate::fs_util;
use crate::output::{ProgressEvent, ProgressSink};
use crate::paths;

static SESSION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"ses-([a-zA-Z0-9]+)").expect("valid session regex"));

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReorganizeReport {
    pub subjects_standardized: usize,
    pub anat_files_moved: usize,
    pub transforms_moved: usize,
    pub files_rewritten: usize,
}

impl ReorganizeReport {
    pub fn files_moved(&self) -> usize {
        self.anat_files_moved + self.transforms_moved
    }
}

pub fn reorganize_data(
    base_dir: &Utf8Path,
    sink: &dyn ProgressSink,
) -> Result<ReorganizeReport, ConnError> {
    let base = paths::normalize(base_dir)?;
    paths::require_dir("derivatives directory", &base)?;
    sink.event(ProgressEvent::info(format!(
        "Starting reorganization in {base}..."
    )));

    let mut report = ReorganizeReport::default();
    standardize_single_sessions(&base, sink, &mut report)?;
    rescope_transforms(&base, sink, &mut report)?;

    sink.event(ProgressEvent::success("Reorganization complete."));
    Ok(report)
}

fn standardize_single_sessions(
    base: &Utf8Path,
    sink: &dyn ProgressSink,
    report: &mut ReorganizeReport,
) -> Result<(), ConnError> {
    for subject in child_dirs(base, "sub-")? {
        let subject_path = base.join(&subject);
        let sessions = child_dirs(&subject_path, "ses-")?;
        let [session] = sessions.as_slice() else {
            continue;
        };

        let subject_anat = subject_path.join("anat");
        let session_anat = subject_path.join(session).join("anat");
        if subject_anat.exists() || !session_anat.exists() {
            continue;
        }

        sink.event(ProgressEvent::info(format!(
            "Standardizing single-session subject: {subject}"
        )));
        fs::create_dir_all(&subject_anat)
            .map_err(|err| ConnError::Filesystem(format!("create {subject_anat}: {err}")))?;

        let session_token = format!("_{session}_");
        for file in child_files(&session_anat)? {
            // Transforms stay with their session.
            if file.ends_with("xfm.txt") {
                continue;
            }
            let target = subject_anat.join(file.replace(&session_token, "_"));
            fs_util::move_file(&session_anat.join(&file), &target)?;
            report.anat_files_moved += 1;
        }

        let json_rewrites = vec![
            (
                format!("{session}/anat/{subject}_{session}_"),
                format!("anat/{subject}_"),
            ),
            (format!("{subject}_{session}_"), format!("{subject}_")),
        ];
        for file in child_files(&subject_anat)? {
            if file.ends_with(".json")
                && fs_util::replace_in_file(&subject_anat.join(&file), &json_rewrites)?
            {
                report.files_rewritten += 1;
            }
        }

        let html = base.join(format!("{subject}.html"));
        if html.is_file() {
            let html_rewrites = vec![
                (
                    format!("{subject}/{session}/anat/{subject}_{session}_"),
                    format!("{subject}/anat/{subject}_"),
                ),
                (
                    format!("{subject}_{session}_acq-mprage"),
                    format!("{subject}_acq-mprage"),
                ),
            ];
            if fs_util::replace_in_file(&html, &html_rewrites)? {
                report.files_rewritten += 1;
            }
        }
        report.subjects_standardized += 1;
    }
    Ok(())
}

fn rescope_transforms(
    base: &Utf8Path,
    sink: &dyn ProgressSink,
    report: &mut ReorganizeReport,
) -> Result<(), ConnError> {
    // Collected up front: the moves below create new anat directories.
    let anat_dirs = WalkDir::new(base)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_dir() && entry.file_name() == "anat")
        .filter_map(|entry| paths::to_utf8(entry.into_path()).ok())
        .filter(|dir| {
            dir.parent()
                .and_then(Utf8Path::file_name)
                .is_some_and(|name| name.starts_with("sub-"))
        })
        .collect::<Vec<_>>();

    for anat_dir in anat_dirs {
        let Some(subject_path) = anat_dir.parent().map(Utf8Path::to_path_buf) else {
            continue;
        };
        let subject = paths::file_name(&subject_path).to_string();

        let mut touched_sessions = BTreeSet::new();
        for file in child_files(&anat_dir)? {
            if !(file.contains("_ses-") && file.ends_with("_xfm.txt")) {
                continue;
            }
            let Some(caps) = SESSION_RE.captures(&file) else {
                continue;
            };
            let session = format!("ses-{}", &caps[1]);
            let target_dir = subject_path.join(&session).join("anat");
            fs::create_dir_all(&target_dir)
                .map_err(|err| ConnError::Filesystem(format!("create {target_dir}: {err}")))?;

            sink.event(ProgressEvent::info(format!(
                "Ensuring co-registration transform is in session folder: {subject}/{session}"
            )));
            fs_util::move_file(&anat_dir.join(&file), &target_dir.join(&file))?;
            report.transforms_moved += 1;
            touched_sessions.insert(session);
        }

        for session in touched_sessions {
            report.files_rewritten +=
                rewrite_session_references(base, &subject_path, &subject, &session)?;
        }
    }
    Ok(())
}

fn rewrite_session_references(
    base: &Utf8Path,
    subject_path: &Utf8Path,
    subject: &str,
    session: &str,
) -> Result<usize, ConnError> {
    let mut rewritten = 0;

    let html = base.join(format!("{subject}.html"));
    if html.is_file() {
        let html_rewrites = vec![(
            format!("{subject}/anat/{subject}_{session}_"),
            format!("{subject}/{session}/anat/{subject}_{session}_"),
        )];
        if fs_util::replace_in_file(&html, &html_rewrites)? {
            rewritten += 1;
        }
    }

    let needle = format!("anat/{subject}_{session}_");
    let replacement = format!("{session}/anat/{subject}_{session}_");
    let scoped_prefix = format!("{session}/");
    let json_files = WalkDir::new(subject_path)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| {
            entry
                .file_name()
                .to_str()
                .is_some_and(|name| name.ends_with(".json"))
        })
        .filter_map(|entry| paths::to_utf8(entry.into_path()).ok());
    for json in json_files {
        let changed = fs_util::rewrite_file(&json, |content| {
            replace_unscoped(content, &needle, &replacement, &scoped_prefix)
        })?;
        if changed {
            rewritten += 1;
        }
    }
    Ok(rewritten)
}

/// Replaces `needle` except where it already follows `prefix`.
fn replace_unscoped(content: &str, needle: &str, replacement: &str, prefix: &str) -> String {
    let mut out = String::with_capacity(content.len());
    let mut last = 0;
    for (start, _) in content.match_indices(needle) {
        out.push_str(&content[last..start]);
        if content[..start].ends_with(prefix) {
            out.push_str(needle);
        } else {
            out.push_str(replacement);
        }
        last = start + needle.len();
    }
    out.push_str(&content[last..]);
    out
}

fn child_dirs(dir: &Utf8Path, prefix: &str) -> Result<Vec<String>, ConnError> {
    let mut names = dir
        .read_dir_utf8()
        .map_err(|err| ConnError::Filesystem(format!("read {dir}: {err}")))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_name().starts_with(prefix) && entry.path().is_dir())
        .map(|entry| entry.file_name().to_string())
        .collect::<Vec<_>>();
    names.sort();
    Ok(names)
}

fn child_files(dir: &Utf8Path) -> Result<Vec<String>, ConnError> {
    let mut names = dir
        .read_dir_utf8()
        .map_err(|err| ConnError::Filesystem(format!("read {dir}: {err}")))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().is_file())
        .map(|entry| entry.file_name().to_string())
        .collect::<Vec<_>>();
    names.sort();
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scoped_references_are_not_rescoped_twice() {
        let content = r#"["sub-01/anat/sub-01_ses-2_xfm.txt", "ses-2/anat/sub-01_ses-2_xfm.txt"]"#;
        let out = replace_unscoped(
            content,
            "anat/sub-01_ses-2_",
            "ses-2/anat/sub-01_ses-2_",
            "ses-2/",
        );
        assert_eq!(
            out,
            r#"["sub-01/ses-2/anat/sub-01_ses-2_xfm.txt", "ses-2/anat/sub-01_ses-2_xfm.txt"]"#
        );
    }
}
