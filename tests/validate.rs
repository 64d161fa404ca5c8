use std::fs;
use std::io::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use assert_matches::assert_matches;
use camino::{Utf8Path, Utf8PathBuf};
use flate2::Compression;
use flate2::write::GzEncoder;

use conn_pipeline::error::ConnError;
use conn_pipeline::output::{ProgressEvent, ProgressSink};
use conn_pipeline::validate::{DerivativeValidator, GzipDecodeCheck, IntegrityCheck};

struct Quiet;

impl ProgressSink for Quiet {
    fn event(&self, _event: ProgressEvent) {}
}

/// Rejects one fixed path.
struct RejectOne {
    bad: Utf8PathBuf,
}

impl IntegrityCheck for RejectOne {
    fn check(&self, path: &Utf8Path) -> Result<(), String> {
        if path == self.bad.as_path() {
            Err("invalid compressed data--crc error".to_string())
        } else {
            Ok(())
        }
    }
}

/// A check killed by Ctrl-C: raises the interrupt flag and fails.
struct InterruptedCheck {
    flag: Arc<AtomicBool>,
    calls: Arc<AtomicUsize>,
}

impl IntegrityCheck for InterruptedCheck {
    fn check(&self, _path: &Utf8Path) -> Result<(), String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.flag.store(true, Ordering::SeqCst);
        Err("unknown".to_string())
    }
}

fn derivatives() -> (tempfile::TempDir, Utf8PathBuf) {
    let temp = tempfile::tempdir().unwrap();
    let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
    for subject in ["sub-01", "sub-02", "sub-03"] {
        let func = root.join(subject).join("func");
        let anat = root.join(subject).join("anat");
        fs::create_dir_all(&func).unwrap();
        fs::create_dir_all(&anat).unwrap();
        fs::write(
            func.join(format!(
                "{subject}_task-rest_space-MNI152NLin2009cAsym_desc-preproc_bold.nii.gz"
            )),
            b"",
        )
        .unwrap();
        fs::write(anat.join(format!("{subject}_desc-preproc_T1w.nii.gz")), b"").unwrap();
        fs::write(func.join(format!("{subject}_desc-confounds_timeseries.tsv")), b"").unwrap();
    }
    (temp, root)
}

#[test]
fn exactly_one_failing_file_is_reported() {
    let (_temp, root) = derivatives();
    let bad = root.join("sub-02/anat/sub-02_desc-preproc_T1w.nii.gz");
    let check = RejectOne { bad: bad.clone() };
    let validator = DerivativeValidator::new(Box::new(check));

    let report = validator.validate(&root, &Quiet).unwrap();

    assert!(!report.is_ok());
    assert_eq!(report.checked, 6);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].path, bad);
    assert_eq!(report.failures[0].detail, "invalid compressed data--crc error");

    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["failures"][0]["path"], bad.as_str());
}

#[test]
fn gate_turns_failures_into_an_error() {
    let (_temp, root) = derivatives();
    let check = RejectOne {
        bad: root.join("sub-01/func/sub-01_task-rest_space-MNI152NLin2009cAsym_desc-preproc_bold.nii.gz"),
    };
    let validator = DerivativeValidator::new(Box::new(check));

    let err = validator.gate(&root, &Quiet).unwrap_err();
    assert_matches!(err, ConnError::ValidationFailed { count: 1 });
}

#[test]
fn non_volume_files_are_not_checked() {
    let (_temp, root) = derivatives();
    let candidates = DerivativeValidator::candidates(&root);
    assert_eq!(candidates.len(), 6);
    assert!(candidates.iter().all(|path| path.as_str().ends_with(".nii.gz")));
    let mut sorted = candidates.clone();
    sorted.sort();
    assert_eq!(candidates, sorted);
}

#[test]
fn in_process_check_detects_truncation() {
    let temp = tempfile::tempdir().unwrap();
    let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
    let anat = root.join("sub-01/anat");
    fs::create_dir_all(&anat).unwrap();

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&vec![3u8; 64 * 1024]).unwrap();
    let bytes = encoder.finish().unwrap();
    fs::write(anat.join("sub-01_desc-preproc_T1w.nii.gz"), &bytes).unwrap();
    fs::write(anat.join("sub-01_space-MNI152NLin2009cAsym_T1w.nii.gz"), &bytes[..bytes.len() / 2])
        .unwrap();

    let report = DerivativeValidator::new(Box::new(GzipDecodeCheck))
        .validate(&root, &Quiet)
        .unwrap();

    assert_eq!(report.checked, 2);
    assert_eq!(report.failures.len(), 1);
    assert!(report.failures[0]
        .path
        .as_str()
        .ends_with("sub-01_space-MNI152NLin2009cAsym_T1w.nii.gz"));
}

#[test]
fn missing_root_is_reported() {
    let validator = DerivativeValidator::new(Box::new(GzipDecodeCheck));
    let err = validator
        .validate(Utf8Path::new("/nonexistent/fmriprep"), &Quiet)
        .unwrap_err();
    assert_matches!(err, ConnError::PathNotFound { kind: "fMRIprep directory", .. });
}

#[test]
fn interrupt_stops_validation_without_reporting_corruption() {
    let (_temp, root) = derivatives();
    let flag = Arc::new(AtomicBool::new(false));
    let calls = Arc::new(AtomicUsize::new(0));
    let check = InterruptedCheck {
        flag: Arc::clone(&flag),
        calls: Arc::clone(&calls),
    };
    let validator = DerivativeValidator::new(Box::new(check)).with_interrupt(flag);

    let err = validator.gate(&root, &Quiet).unwrap_err();

    assert_matches!(err, ConnError::Interrupted);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}
