use std::collections::BTreeMap;
use std::fs;
use std::io::{BufRead, BufReader};
use std::sync::LazyLock;

use camino::{Utf8Path, Utf8PathBuf};
use regex::Regex;
use serde::Serialize;

use crate::error::ConnError;
use crate::fs_util;
use crate::output::{ProgressEvent, ProgressSink};
use crate::paths;

pub const OUTPUT_FILE: &str = "participants_with_conn.tsv";
pub const CONN_ID_COLUMN: &str = "conn_id";
pub const MISSING_VALUE: &str = "n/a";

static IMPORT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"sub-([A-Za-z0-9]+).*imported to subject ([0-9]+)").expect("valid import regex")
});

/// BIDS participant id -> CONN subject index. A later log line for the same
/// participant replaces the earlier index.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConnIdMapping(BTreeMap<String, String>);

impl ConnIdMapping {
    pub fn get(&self, participant_id: &str) -> Option<&str> {
        self.0.get(participant_id).map(String::as_str)
    }

    pub fn insert(&mut self, participant_id: String, conn_id: String) {
        self.0.insert(participant_id, conn_id);
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn from_log(reader: impl BufRead) -> Result<Self, ConnError> {
        let mut mapping = Self::default();
        for line in reader.split(b'\n') {
            let line = line.map_err(|err| ConnError::Filesystem(err.to_string()))?;
            let line = String::from_utf8_lossy(&line);
            if let Some(caps) = IMPORT_RE.captures(&line) {
                mapping.insert(format!("sub-{}", &caps[1]), caps[2].to_string());
            }
        }
        Ok(mapping)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParticipantTable {
    pub header: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl ParticipantTable {
    pub fn parse(content: &str) -> Option<Self> {
        let mut lines = content.lines();
        let header_line = lines.next()?;
        let header = header_line
            .trim()
            .split('\t')
            .map(str::to_string)
            .collect::<Vec<_>>();
        let rows = lines
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(|line| line.split('\t').map(str::to_string).collect())
            .collect();
        Some(Self { header, rows })
    }

    pub fn conn_id_index(&self) -> Option<usize> {
        self.header.iter().position(|column| column == CONN_ID_COLUMN)
    }

    pub fn merge_conn_ids(&mut self, mapping: &ConnIdMapping) {
        let index = match self.conn_id_index() {
            Some(index) => index,
            None => {
                self.header.push(CONN_ID_COLUMN.to_string());
                self.header.len() - 1
            }
        };
        let width = self.header.len();
        for row in &mut self.rows {
            let conn_id = row
                .first()
                .and_then(|participant_id| mapping.get(participant_id))
                .unwrap_or(MISSING_VALUE)
                .to_string();
            if row.len() <= index {
                row.resize(index, MISSING_VALUE.to_string());
                row.push(conn_id);
            } else {
                row[index] = conn_id;
            }
            row.resize(width, MISSING_VALUE.to_string());
        }
    }

    pub fn render(&self) -> String {
        let mut out = self.header.join("\t");
        out.push('\n');
        for row in &self.rows {
            out.push_str(&row.join("\t"));
            out.push('\n');
        }
        out
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MappingOutcome {
    pub output_path: Utf8PathBuf,
    pub mappings: usize,
    pub rows: usize,
    pub updated_existing_column: bool,
}

pub fn conn_log_path(project_file: &Utf8Path) -> Utf8PathBuf {
    let dir = project_file.parent().unwrap_or(Utf8Path::new(""));
    let stem = project_file.file_stem().unwrap_or_default();
    dir.join(stem).join("logfile.txt")
}

pub fn run_mapping(
    conn_path: &Utf8Path,
    bids_dir: &Utf8Path,
    sink: &dyn ProgressSink,
) -> Result<MappingOutcome, ConnError> {
    let project_file = paths::normalize(conn_path)?;
    let bids_dir = paths::normalize(bids_dir)?;

    paths::require_file("CONN project file", &project_file)?;
    paths::require_dir("BIDS directory", &bids_dir)?;

    let log_path = conn_log_path(&project_file);
    paths::require_file("CONN log file", &log_path)?;

    let participants_path = bids_dir.join("participants.tsv");
    paths::require_file("participants.tsv", &participants_path)?;

    sink.event(ProgressEvent::info(format!("Reading log file: {log_path}")));
    let log = fs::File::open(&log_path)
        .map_err(|err| ConnError::Filesystem(format!("open {log_path}: {err}")))?;
    let mapping = ConnIdMapping::from_log(BufReader::new(log))?;
    if mapping.is_empty() {
        sink.event(ProgressEvent::warning(
            "No mappings found in log file. Check if data import is logged correctly.",
        ));
    } else {
        sink.event(ProgressEvent::info(format!(
            "Found {} participant mappings.",
            mapping.len()
        )));
    }

    sink.event(ProgressEvent::info(format!(
        "Reading BIDS participants: {participants_path}"
    )));
    let content = fs::read_to_string(&participants_path)
        .map_err(|err| ConnError::Filesystem(format!("read {participants_path}: {err}")))?;
    let mut table = ParticipantTable::parse(&content)
        .ok_or_else(|| ConnError::EmptyParticipants(participants_path.clone()))?;

    let updated_existing_column = table.conn_id_index().is_some();
    if updated_existing_column {
        sink.event(ProgressEvent::info(
            "Note: 'conn_id' column already exists. Updating values.",
        ));
    }
    table.merge_conn_ids(&mapping);

    let output_path = project_file
        .parent()
        .unwrap_or(Utf8Path::new(""))
        .join(OUTPUT_FILE);
    fs_util::write_atomic(&output_path, table.render().as_bytes())?;
    sink.event(ProgressEvent::success(format!(
        "Successfully saved updated participants list to: {output_path}"
    )));

    Ok(MappingOutcome {
        output_path,
        mappings: mapping.len(),
        rows: table.rows.len(),
        updated_existing_column,
    })
}
