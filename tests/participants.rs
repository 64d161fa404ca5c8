use std::fs;
use std::sync::Mutex;

use assert_matches::assert_matches;
use camino::{Utf8Path, Utf8PathBuf};

use conn_pipeline::error::ConnError;
use conn_pipeline::output::{Level, ProgressEvent, ProgressSink};
use conn_pipeline::participants::{ConnIdMapping, ParticipantTable, run_mapping};

#[derive(Default)]
struct RecordingSink {
    events: Mutex<Vec<ProgressEvent>>,
}

impl ProgressSink for RecordingSink {
    fn event(&self, event: ProgressEvent) {
        self.events.lock().unwrap().push(event);
    }
}

impl RecordingSink {
    fn warnings(&self) -> Vec<String> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|event| event.level == Level::Warning)
            .map(|event| event.message.clone())
            .collect()
    }
}

struct Study {
    _temp: tempfile::TempDir,
    project_file: Utf8PathBuf,
    bids: Utf8PathBuf,
}

fn study(log: &str, participants: &str) -> Study {
    let temp = tempfile::tempdir().unwrap();
    let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
    let project_file = root.join("conn_study.mat");
    fs::write(&project_file, b"MATLAB 5.0").unwrap();
    fs::create_dir_all(root.join("conn_study")).unwrap();
    fs::write(root.join("conn_study/logfile.txt"), log).unwrap();

    let bids = root.join("bids");
    fs::create_dir_all(&bids).unwrap();
    fs::write(bids.join("participants.tsv"), participants).unwrap();
    Study {
        _temp: temp,
        project_file,
        bids,
    }
}

fn mapping(log: &str) -> ConnIdMapping {
    ConnIdMapping::from_log(log.as_bytes()).unwrap()
}

#[test]
fn appends_conn_id_column() {
    let mut table = ParticipantTable::parse("participant_id\tage\nsub-01\t34\n").unwrap();
    table.merge_conn_ids(&mapping(
        "Importing sub-01 func: imported to subject 7 session 1\n",
    ));
    assert_eq!(table.render(), "participant_id\tage\tconn_id\nsub-01\t34\t7\n");
}

#[test]
fn indented_rows_still_match_their_participant() {
    let mut table =
        ParticipantTable::parse("participant_id\tage\r\n  sub-01\t34\r\n\tsub-02\t29\n").unwrap();
    table.merge_conn_ids(&mapping(
        "sub-01 imported to subject 1\nsub-02 imported to subject 2\n",
    ));
    assert_eq!(
        table.render(),
        "participant_id\tage\tconn_id\nsub-01\t34\t1\nsub-02\t29\t2\n"
    );
}

#[test]
fn unmapped_participants_get_missing_value() {
    let mut table =
        ParticipantTable::parse("participant_id\tage\nsub-01\t34\nsub-05\t29\n").unwrap();
    table.merge_conn_ids(&mapping("sub-01 imported to subject 1\n"));
    assert_eq!(table.rows[1], vec!["sub-05", "29", "n/a"]);
}

#[test]
fn later_log_line_overwrites_earlier_mapping() {
    let found = mapping(
        "sub-02 run imported to subject 12 session 1\nsub-02 run imported to subject 99 session 2\n",
    );
    assert_eq!(found.len(), 1);
    assert_eq!(found.get("sub-02"), Some("99"));
}

#[test]
fn existing_conn_id_column_is_updated_in_place() {
    let mut table =
        ParticipantTable::parse("participant_id\tconn_id\tage\nsub-01\t3\t34\nsub-02\n").unwrap();
    table.merge_conn_ids(&mapping(
        "sub-01 imported to subject 4\nsub-02 imported to subject 5\n",
    ));
    assert_eq!(
        table.render(),
        "participant_id\tconn_id\tage\nsub-01\t4\t34\nsub-02\t5\tn/a\n"
    );
}

#[test]
fn run_mapping_writes_next_to_project_file() {
    let study = study(
        "sub-01 imported to subject 1 session 1\nsub-02 imported to subject 2 session 1\n",
        "participant_id\tage\nsub-01\t34\nsub-02\t41\n\n",
    );
    let sink = RecordingSink::default();

    let outcome = run_mapping(&study.project_file, &study.bids, &sink).unwrap();

    assert_eq!(outcome.mappings, 2);
    assert_eq!(outcome.rows, 2);
    assert!(!outcome.updated_existing_column);
    assert_eq!(
        outcome.output_path,
        study.project_file.parent().unwrap().join("participants_with_conn.tsv")
    );
    let written = fs::read_to_string(&outcome.output_path).unwrap();
    assert_eq!(
        written,
        "participant_id\tage\tconn_id\nsub-01\t34\t1\nsub-02\t41\t2\n"
    );
    let original = fs::read_to_string(study.bids.join("participants.tsv")).unwrap();
    assert!(!original.contains("conn_id"));
}

#[test]
fn empty_log_warns_and_fills_missing_values() {
    let study = study("Setup complete\n", "participant_id\nsub-01\n");
    let sink = RecordingSink::default();

    let outcome = run_mapping(&study.project_file, &study.bids, &sink).unwrap();

    assert_eq!(outcome.mappings, 0);
    assert_eq!(sink.warnings().len(), 1);
    let written = fs::read_to_string(&outcome.output_path).unwrap();
    assert_eq!(written, "participant_id\tconn_id\nsub-01\tn/a\n");
}

#[test]
fn missing_log_file_is_reported() {
    let study = study("", "participant_id\nsub-01\n");
    fs::remove_file(
        study
            .project_file
            .parent()
            .unwrap()
            .join("conn_study/logfile.txt"),
    )
    .unwrap();

    let err = run_mapping(&study.project_file, &study.bids, &RecordingSink::default()).unwrap_err();
    assert_matches!(err, ConnError::PathNotFound { kind: "CONN log file", .. });
}

#[test]
fn empty_participants_file_is_an_error() {
    let study = study("sub-01 imported to subject 1\n", "");
    let err = run_mapping(&study.project_file, &study.bids, &RecordingSink::default()).unwrap_err();
    assert_matches!(err, ConnError::EmptyParticipants(_));
}

#[test]
fn missing_project_file_is_reported() {
    let err = run_mapping(
        Utf8Path::new("/nonexistent/conn_study.mat"),
        Utf8Path::new("/nonexistent/bids"),
        &RecordingSink::default(),
    )
    .unwrap_err();
    assert_matches!(err, ConnError::PathNotFound { kind: "CONN project file", .. });
}
