use std::fs;

use assert_matches::assert_matches;
use camino::{Utf8Path, Utf8PathBuf};

use conn_pipeline::error::ConnError;
use conn_pipeline::export::export_light;
use conn_pipeline::output::{ProgressEvent, ProgressSink};

struct Quiet;

impl ProgressSink for Quiet {
    fn event(&self, _event: ProgressEvent) {}
}

fn touch(path: &Utf8Path) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, path.as_str()).unwrap();
}

fn project() -> (tempfile::TempDir, Utf8PathBuf) {
    let temp = tempfile::tempdir().unwrap();
    let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
    let mat = root.join("study/conn_rest.mat");
    touch(&mat);
    let dir = root.join("study/conn_rest");
    touch(&dir.join("results/firstlevel/SBC_01/resultsROI_Condition001.mat"));
    touch(&dir.join("data/ROI_Subject001_Condition000.mat"));
    touch(&dir.join("data/DATA_Subject001_Session001.mat"));
    touch(&dir.join("data/VV_DATA_Subject001_Session001.nii"));
    touch(&dir.join("data/BA_Subject001_Condition001.mat"));
    touch(&dir.join("preprocessing/DATA_Subject001_Session001.mat"));
    touch(&dir.join("results/preprocessing/ROI_Subject001.mat"));
    touch(&dir.join("results/secondlevel/con_0001.nii"));
    touch(&dir.join("results/DATA_Subject001.mat"));
    (temp, mat)
}

#[test]
fn heavy_volumes_are_left_behind() {
    let (temp, mat) = project();
    let dest = Utf8PathBuf::from_path_buf(temp.path().join("export")).unwrap();

    let report = export_light(&mat, &dest, &Quiet).unwrap();

    let out = dest.join("conn_rest");
    assert_eq!(report.destination, out);
    assert!(dest.join("conn_rest.mat").is_file());
    assert!(out.join("results/firstlevel/SBC_01/resultsROI_Condition001.mat").is_file());
    assert!(out.join("data/ROI_Subject001_Condition000.mat").is_file());
    // Subject prefixes only matter inside data/.
    assert!(out.join("results/DATA_Subject001.mat").is_file());

    assert!(!out.join("data/DATA_Subject001_Session001.mat").exists());
    assert!(!out.join("data/VV_DATA_Subject001_Session001.nii").exists());
    assert!(!out.join("data/BA_Subject001_Condition001.mat").exists());
    assert!(!out.join("preprocessing").exists());
    assert!(!out.join("results/preprocessing").exists());
    assert!(!out.join("results/secondlevel/con_0001.nii").exists());

    assert_eq!(report.files_copied, 4);

    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["destination"], out.as_str());
    assert_eq!(json["files_copied"], 4);
}

#[test]
fn existing_destination_project_is_replaced() {
    let (temp, mat) = project();
    let dest = Utf8PathBuf::from_path_buf(temp.path().join("export")).unwrap();
    touch(&dest.join("conn_rest/stale.txt"));

    export_light(&mat, &dest, &Quiet).unwrap();

    assert!(!dest.join("conn_rest/stale.txt").exists());
    assert!(dest.join("conn_rest/data/ROI_Subject001_Condition000.mat").is_file());
}

#[test]
fn project_directory_must_exist() {
    let (_temp, mat) = project();
    fs::remove_dir_all(mat.parent().unwrap().join("conn_rest")).unwrap();

    let err = export_light(&mat, Utf8Path::new("/tmp/unused-export"), &Quiet).unwrap_err();
    assert_matches!(err, ConnError::PathNotFound { kind: "CONN project directory", .. });
}
