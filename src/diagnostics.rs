use std::collections::VecDeque;
use std::fmt::Write as _;
use std::fs::{self, OpenOptions};
use std::io::{self, Read, Write};
use std::sync::LazyLock;

use camino::{Utf8Path, Utf8PathBuf};
use flate2::read::GzDecoder;
use glob::Pattern;
use regex::Regex;

use crate::error::ConnError;

pub const TAIL_LINES: usize = 200;
pub const CONN_PROJECT_DIR: &str = "conn_project";
pub const CONN_PROJECT_LOGS: [&str; 2] = ["logfile.txt", "statusfile.open"];

const FUNC_PATTERN: &str = "*space-MNI152NLin2009cAsym*desc-preproc_bold.nii.gz";
const ANAT_PATTERN: &str = "*space-MNI152NLin2009cAsym*T1w.nii.gz";
const ANAT_FALLBACK_PATTERN: &str = "*_T1w.nii.gz";

const NIFTI1_HEADER_SIZE: usize = 348;

static SUBJECT_SESSION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Subject\s+(\d+)\s+Session\s+(\d+)").expect("valid subject/session regex")
});

pub fn append_to_log(log_file: &Utf8Path, text: &str) -> Result<(), ConnError> {
    if let Some(parent) = log_file.parent() {
        fs::create_dir_all(parent).map_err(|err| ConnError::Filesystem(err.to_string()))?;
    }
    let mut handle = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_file)
        .map_err(|err| ConnError::Filesystem(format!("open {log_file}: {err}")))?;
    handle
        .write_all(text.as_bytes())
        .map_err(|err| ConnError::Filesystem(format!("write {log_file}: {err}")))
}

pub fn tail_file(path: &Utf8Path, count: usize) -> String {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) => return format!("[Unable to read {path}: {err}]\n"),
    };
    let text = String::from_utf8_lossy(&bytes);
    let mut tail = VecDeque::with_capacity(count);
    for line in text.split_inclusive('\n') {
        if tail.len() == count {
            tail.pop_front();
        }
        tail.push_back(line);
    }
    tail.into_iter().collect()
}

pub fn append_conn_project_logs(
    project_dir: &Utf8Path,
    log_file: &Utf8Path,
) -> Result<(), ConnError> {
    let conn_dir = project_dir.join(CONN_PROJECT_DIR);
    if !conn_dir.is_dir() {
        return Ok(());
    }
    let mut text = String::from("\n--- CONN project logs ---\n");
    for entry in CONN_PROJECT_LOGS {
        let path = conn_dir.join(entry);
        if path.is_file() {
            let _ = write!(text, "\n[{entry}]\n");
            text.push_str(&tail_file(&path, TAIL_LINES));
        }
    }
    append_to_log(log_file, &text)
}

pub fn extract_failure_subject_session(output: &str) -> Option<(usize, usize)> {
    let caps = SUBJECT_SESSION_RE.captures_iter(output).last()?;
    let subject = caps[1].parse().ok()?;
    let session = caps[2].parse().ok()?;
    Some((subject, session))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub path: Utf8PathBuf,
    pub size: u64,
}

#[derive(Debug, Clone)]
pub struct SubjectDiagnostics {
    pub subject_index: usize,
    pub session_index: usize,
    pub subject_dir: Utf8PathBuf,
    pub session_label: String,
    pub functional: Vec<FileEntry>,
    pub structural: Vec<FileEntry>,
    pub probes: Vec<(Utf8PathBuf, Result<Vec<usize>, String>)>,
}

impl SubjectDiagnostics {
    /// Resolves CONN's 1-based subject/session indices against the sorted
    /// `sub-*` directories of the derivatives tree. `None` when the subject
    /// index is out of range.
    pub fn collect(
        derivatives_dir: &Utf8Path,
        subject_index: usize,
        session_index: usize,
        sessions: &[String],
    ) -> Option<Self> {
        let mut subject_dirs = derivatives_dir
            .read_dir_utf8()
            .ok()?
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_name().starts_with("sub-") && entry.path().is_dir())
            .map(|entry| entry.into_path())
            .collect::<Vec<_>>();
        subject_dirs.sort();
        if subject_index < 1 || subject_index > subject_dirs.len() {
            return None;
        }
        let subject_dir = subject_dirs.swap_remove(subject_index - 1);

        let session_label = match session_index.checked_sub(1).and_then(|i| sessions.get(i)) {
            Some(label) => label.clone(),
            None => format!("ses-{session_index}"),
        };

        let func_dir = subject_dir.join(&session_label).join("func");
        let functional = matching_entries(&func_dir, FUNC_PATTERN);
        let anat_dir = subject_dir.join("anat");
        let mut structural = matching_entries(&anat_dir, ANAT_PATTERN);
        if structural.is_empty() {
            structural = matching_entries(&anat_dir, ANAT_FALLBACK_PATTERN);
        }
        let probes = functional
            .iter()
            .chain(structural.iter())
            .map(|entry| (entry.path.clone(), probe_nifti(&entry.path)))
            .collect();

        Some(Self {
            subject_index,
            session_index,
            subject_dir,
            session_label,
            functional,
            structural,
            probes,
        })
    }

    pub fn render(&self) -> String {
        let mut out = String::from("\n--- Subject/session diagnostics ---\n");
        let _ = writeln!(out, "Subject index: {}", self.subject_index);
        let _ = writeln!(out, "Session index: {}", self.session_index);
        let _ = writeln!(out, "Subject dir: {}", self.subject_dir);
        let _ = writeln!(out, "Session label: {}", self.session_label);
        render_entries(&mut out, "Functional files", &self.functional);
        render_entries(&mut out, "Structural files", &self.structural);
        out.push_str("\n[NIfTI read check]\n");
        for (path, probe) in &self.probes {
            match probe {
                Ok(shape) => {
                    let dims = shape.iter().map(usize::to_string).collect::<Vec<_>>();
                    let _ = writeln!(out, "  OK: {path} shape=({})", dims.join(", "));
                }
                Err(err) => {
                    let _ = writeln!(out, "  FAIL: {path} error={err}");
                }
            }
        }
        out
    }
}

fn render_entries(out: &mut String, title: &str, entries: &[FileEntry]) {
    let _ = write!(out, "\n[{title}]\n");
    if entries.is_empty() {
        out.push_str("  (none found)\n");
    }
    for entry in entries {
        let _ = writeln!(out, "  {} ({} bytes)", entry.path, entry.size);
    }
}

fn matching_entries(dir: &Utf8Path, pattern: &str) -> Vec<FileEntry> {
    let (Ok(pattern), Ok(entries)) = (Pattern::new(pattern), dir.read_dir_utf8()) else {
        return Vec::new();
    };
    let mut found = entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| pattern.matches(entry.file_name()))
        .filter_map(|entry| {
            let path = entry.into_path();
            let size = fs::metadata(&path).ok().filter(|meta| meta.is_file())?.len();
            Some(FileEntry { path, size })
        })
        .collect::<Vec<_>>();
    found.sort_by(|a, b| a.path.cmp(&b.path));
    found
}

pub fn probe_nifti(path: &Utf8Path) -> Result<Vec<usize>, String> {
    let file = fs::File::open(path).map_err(|err| err.to_string())?;
    let mut header = [0u8; NIFTI1_HEADER_SIZE];
    let read = if path.as_str().ends_with(".gz") {
        GzDecoder::new(file).read_exact(&mut header)
    } else {
        io::BufReader::new(file).read_exact(&mut header)
    };
    read.map_err(|err| format!("header unreadable: {err}"))?;
    parse_nifti1_shape(&header)
}

fn parse_nifti1_shape(header: &[u8; NIFTI1_HEADER_SIZE]) -> Result<Vec<usize>, String> {
    let size_bytes = [header[0], header[1], header[2], header[3]];
    let little = if i32::from_le_bytes(size_bytes) == NIFTI1_HEADER_SIZE as i32 {
        true
    } else if i32::from_be_bytes(size_bytes) == NIFTI1_HEADER_SIZE as i32 {
        false
    } else {
        return Err("not a NIfTI-1 header".to_string());
    };
    let magic = &header[344..348];
    if magic != b"n+1\0" && magic != b"ni1\0" {
        return Err("bad NIfTI-1 magic".to_string());
    }

    let dim = |i: usize| {
        let bytes = [header[40 + 2 * i], header[41 + 2 * i]];
        if little {
            i16::from_le_bytes(bytes)
        } else {
            i16::from_be_bytes(bytes)
        }
    };
    let ndim = dim(0);
    if !(1..=7).contains(&ndim) {
        return Err(format!("invalid dimension count {ndim}"));
    }
    (1..=ndim as usize)
        .map(|i| match dim(i) {
            size if size > 0 => Ok(size as usize),
            size => Err(format!("invalid size {size} in dimension {i}")),
        })
        .collect()
}
