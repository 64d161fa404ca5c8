use std::collections::BTreeSet;
use std::fs;
use std::io::{self, Read};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use camino::{Utf8Path, Utf8PathBuf};
use flate2::read::MultiGzDecoder;
use glob::Pattern;
use serde::Serialize;
use tracing::warn;
use walkdir::WalkDir;

use crate::error::ConnError;
use crate::output::{ProgressEvent, ProgressSink};
use crate::paths;
use crate::runner::find_in_path;

pub const DERIVATIVE_PATTERNS: [&str; 3] = [
    "*desc-preproc_bold.nii.gz",
    "*space-MNI152NLin2009cAsym*T1w.nii.gz",
    "*_T1w.nii.gz",
];

pub const CHECK_TIMEOUT: Duration = Duration::from_secs(20);

const POLL_INTERVAL: Duration = Duration::from_millis(25);

pub trait IntegrityCheck: Send + Sync {
    fn check(&self, path: &Utf8Path) -> Result<(), String>;
}

#[derive(Debug, Clone)]
pub struct GunzipCheck {
    program: PathBuf,
    timeout: Duration,
}

impl GunzipCheck {
    pub fn new(program: PathBuf, timeout: Duration) -> Self {
        Self { program, timeout }
    }

    pub fn detect(timeout: Duration) -> Option<Self> {
        find_in_path("gunzip").map(|program| Self::new(program, timeout))
    }
}

impl IntegrityCheck for GunzipCheck {
    fn check(&self, path: &Utf8Path) -> Result<(), String> {
        let mut child = Command::new(&self.program)
            .arg("-t")
            .arg(path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| err.to_string())?;

        let started = Instant::now();
        let status = loop {
            match child.try_wait().map_err(|err| err.to_string())? {
                Some(status) => break status,
                None if started.elapsed() >= self.timeout => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err("timeout".to_string());
                }
                None => thread::sleep(POLL_INTERVAL),
            }
        };
        if status.success() {
            return Ok(());
        }

        let mut stderr = String::new();
        let mut stdout = String::new();
        if let Some(mut pipe) = child.stderr.take() {
            let _ = pipe.read_to_string(&mut stderr);
        }
        if let Some(mut pipe) = child.stdout.take() {
            let _ = pipe.read_to_string(&mut stdout);
        }
        let detail = [stderr.trim(), stdout.trim()]
            .into_iter()
            .find(|text| !text.is_empty())
            .unwrap_or("unknown");
        Err(detail.to_string())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct GzipDecodeCheck;

impl IntegrityCheck for GzipDecodeCheck {
    fn check(&self, path: &Utf8Path) -> Result<(), String> {
        let file = fs::File::open(path).map_err(|err| err.to_string())?;
        let mut decoder = MultiGzDecoder::new(io::BufReader::new(file));
        io::copy(&mut decoder, &mut io::sink())
            .map(|_| ())
            .map_err(|err| err.to_string())
    }
}

pub fn system_check(timeout: Duration) -> Box<dyn IntegrityCheck> {
    match GunzipCheck::detect(timeout) {
        Some(check) => Box::new(check),
        None => {
            warn!("gunzip not found in PATH, using in-process gzip check");
            Box::new(GzipDecodeCheck)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationFailure {
    pub path: Utf8PathBuf,
    pub detail: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ValidationReport {
    pub checked: usize,
    pub failures: Vec<ValidationFailure>,
}

impl ValidationReport {
    pub fn is_ok(&self) -> bool {
        self.failures.is_empty()
    }
}

pub struct DerivativeValidator {
    check: Box<dyn IntegrityCheck>,
    interrupt: Arc<AtomicBool>,
}

impl DerivativeValidator {
    pub fn new(check: Box<dyn IntegrityCheck>) -> Self {
        Self {
            check,
            interrupt: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_interrupt(self, flag: Arc<AtomicBool>) -> Self {
        Self {
            interrupt: flag,
            ..self
        }
    }

    pub fn candidates(root: &Utf8Path) -> Vec<Utf8PathBuf> {
        let patterns = DERIVATIVE_PATTERNS
            .iter()
            .filter_map(|pattern| Pattern::new(pattern).ok())
            .collect::<Vec<_>>();
        WalkDir::new(root)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
            .filter(|entry| {
                entry
                    .file_name()
                    .to_str()
                    .map(|name| patterns.iter().any(|pattern| pattern.matches(name)))
                    .unwrap_or(false)
            })
            .filter_map(|entry| paths::to_utf8(entry.into_path()).ok())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// A check that fails while the interrupt flag is up was killed by the
    /// same Ctrl-C, so it is not recorded as corruption.
    pub fn validate(
        &self,
        root: &Utf8Path,
        sink: &dyn ProgressSink,
    ) -> Result<ValidationReport, ConnError> {
        paths::require_dir("fMRIprep directory", root)?;
        sink.event(ProgressEvent::info("Validating fMRIprep derivative files..."));

        let mut report = ValidationReport::default();
        for path in Self::candidates(root) {
            self.check_interrupt()?;
            let result = self.check.check(&path);
            self.check_interrupt()?;
            report.checked += 1;
            if let Err(detail) = result {
                report.failures.push(ValidationFailure { path, detail });
            }
        }

        if report.is_ok() {
            sink.event(ProgressEvent::success(format!(
                "Validated fMRIprep derivatives (BOLD + structural files, {} checked)",
                report.checked
            )));
        } else {
            sink.event(ProgressEvent::error(
                "Detected corrupt derivative files. Regenerate them before continuing.",
            ));
            for failure in &report.failures {
                sink.event(ProgressEvent::error(format!(
                    "{}: {}",
                    failure.path, failure.detail
                )));
            }
        }
        Ok(report)
    }

    fn check_interrupt(&self) -> Result<(), ConnError> {
        if self.interrupt.load(Ordering::SeqCst) {
            Err(ConnError::Interrupted)
        } else {
            Ok(())
        }
    }

    pub fn gate(
        &self,
        root: &Utf8Path,
        sink: &dyn ProgressSink,
    ) -> Result<ValidationReport, ConnError> {
        let report = self.validate(root, sink)?;
        if report.is_ok() {
            Ok(report)
        } else {
            Err(ConnError::ValidationFailed {
                count: report.failures.len(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use flate2::Compression;
    use flate2::write::GzEncoder;

    use super::*;

    #[test]
    fn decode_check_accepts_valid_gzip_and_rejects_truncated() {
        let temp = tempfile::tempdir().unwrap();
        let good = Utf8PathBuf::from_path_buf(temp.path().join("good.nii.gz")).unwrap();
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&[7u8; 4096]).unwrap();
        let bytes = encoder.finish().unwrap();
        fs::write(&good, &bytes).unwrap();

        let bad = Utf8PathBuf::from_path_buf(temp.path().join("bad.nii.gz")).unwrap();
        fs::write(&bad, &bytes[..bytes.len() / 2]).unwrap();

        assert!(GzipDecodeCheck.check(&good).is_ok());
        assert!(GzipDecodeCheck.check(&bad).is_err());
    }

    #[test]
    fn candidates_are_deduplicated_across_patterns() {
        let temp = tempfile::tempdir().unwrap();
        let anat = temp.path().join("sub-01/anat");
        fs::create_dir_all(&anat).unwrap();
        fs::write(
            anat.join("sub-01_space-MNI152NLin2009cAsym_desc-preproc_T1w.nii.gz"),
            b"",
        )
        .unwrap();
        fs::write(anat.join("sub-01_desc-brain_mask.nii.gz"), b"").unwrap();

        let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        let found = DerivativeValidator::candidates(&root);
        assert_eq!(found.len(), 1);
    }
}
