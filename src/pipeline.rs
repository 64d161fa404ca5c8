use std::fmt::Write as _;
use std::fs;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;
use tracing::debug;

use crate::bids::BidsMetadataReader;
use crate::diagnostics::{self, SubjectDiagnostics};
use crate::error::ConnError;
use crate::output::{ProgressEvent, ProgressSink};
use crate::paths;
use crate::runner::{StageExecution, StageExecutor, StageOutcome};
use crate::template::{LiteralTemplate, ScriptTemplate, Substitutions, matlab_float, matlab_string};
use crate::validate::DerivativeValidator;

pub const LOG_FILE_NAME: &str = "conn_pipeline.log";
pub const DEFAULT_SUBJECTS: usize = 30;
pub const DEFAULT_TR: f64 = 2.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Setup,
    Import,
    Smooth,
    Denoise,
}

impl Stage {
    pub const ALL: [Stage; 4] = [Stage::Setup, Stage::Import, Stage::Smooth, Stage::Denoise];

    pub fn index(self) -> u8 {
        match self {
            Stage::Setup => 1,
            Stage::Import => 2,
            Stage::Smooth => 3,
            Stage::Denoise => 4,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Stage::Setup => "Project Setup",
            Stage::Import => "Import fMRIprep Data",
            Stage::Smooth => "Spatial Smoothing",
            Stage::Denoise => "Denoising",
        }
    }

    pub fn template_file(self) -> &'static str {
        match self {
            Stage::Setup => "batch_conn_01_project_setup.m",
            Stage::Import => "batch_conn_02_import_fmriprep.m",
            Stage::Smooth => "batch_conn_03_smooth.m",
            Stage::Denoise => "batch_conn_04_denoise.m",
        }
    }

    pub fn output_file(self) -> &'static str {
        match self {
            Stage::Setup => "batch_conn_01_setup.m",
            Stage::Import => "batch_conn_02_import.m",
            Stage::Smooth => "batch_conn_03_smooth.m",
            Stage::Denoise => "batch_conn_04_denoise.m",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SkipFlags {
    pub setup: bool,
    pub import: bool,
    pub smooth: bool,
    pub denoise: bool,
}

impl SkipFlags {
    pub fn skips(&self, stage: Stage) -> bool {
        match stage {
            Stage::Setup => self.setup,
            Stage::Import => self.import,
            Stage::Smooth => self.smooth,
            Stage::Denoise => self.denoise,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub project_dir: Utf8PathBuf,
    pub derivatives_dir: Utf8PathBuf,
    pub bids_dir: Utf8PathBuf,
    pub install_dir: Option<Utf8PathBuf>,
    pub template_dir: Utf8PathBuf,
    pub fwhm: u32,
    pub generate_qa: bool,
    pub skip: SkipFlags,
}

impl PipelineOptions {
    pub fn normalized(self) -> Result<Self, ConnError> {
        Ok(Self {
            project_dir: paths::normalize(&self.project_dir)?,
            derivatives_dir: paths::normalize(&self.derivatives_dir)?,
            bids_dir: paths::normalize(&self.bids_dir)?,
            install_dir: self
                .install_dir
                .as_ref()
                .map(|dir| paths::normalize(dir))
                .transpose()?,
            template_dir: paths::normalize(&self.template_dir)?,
            ..self
        })
    }

    pub fn log_file(&self) -> Utf8PathBuf {
        self.project_dir.join(LOG_FILE_NAME)
    }

    pub fn enabled_stages(&self) -> Vec<Stage> {
        Stage::ALL
            .into_iter()
            .filter(|stage| !self.skip.skips(*stage))
            .collect()
    }

    pub fn all_skipped(&self) -> bool {
        self.enabled_stages().is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunParameters {
    pub num_subjects: usize,
    pub tr: f64,
    pub sessions: Vec<String>,
}

impl Default for RunParameters {
    fn default() -> Self {
        Self {
            num_subjects: DEFAULT_SUBJECTS,
            tr: DEFAULT_TR,
            sessions: Vec::new(),
        }
    }
}

impl RunParameters {
    pub fn from_dataset(bids_dir: &Utf8Path, sink: &dyn ProgressSink) -> Self {
        sink.event(ProgressEvent::info("Extracting metadata from BIDS dataset..."));
        let metadata = match BidsMetadataReader::open(bids_dir) {
            Ok(reader) => reader.acquisition_parameters(),
            Err(err) => {
                sink.event(ProgressEvent::warning(format!(
                    "BIDS metadata extraction failed: {err}"
                )));
                sink.event(ProgressEvent::warning(
                    "Using default parameters (could not extract BIDS metadata)",
                ));
                return Self::default();
            }
        };

        let tr = metadata.tr.unwrap_or_else(|| {
            sink.event(ProgressEvent::warning(format!(
                "RepetitionTime not found in BIDS sidecars, using {DEFAULT_TR:.1} s"
            )));
            DEFAULT_TR
        });
        let params = Self {
            num_subjects: metadata.num_subjects,
            tr,
            sessions: metadata.sessions,
        };
        sink.event(ProgressEvent::success("BIDS metadata extracted"));
        sink.event(ProgressEvent::raw(format!(
            "    Subjects:  {}",
            params.num_subjects
        )));
        sink.event(ProgressEvent::raw(format!("    TR:        {:.3} seconds", params.tr)));
        if !params.sessions.is_empty() {
            sink.event(ProgressEvent::raw(format!(
                "    Sessions:  {}",
                params.sessions.join(", ")
            )));
        }
        params
    }
}

#[derive(Debug, Clone)]
pub struct StagePlan {
    pub stage: Stage,
    pub template_path: Utf8PathBuf,
    pub output_path: Utf8PathBuf,
    pub substitutions: Substitutions,
}

pub fn plan_stage(stage: Stage, options: &PipelineOptions, params: &RunParameters) -> StagePlan {
    let project = matlab_string(options.project_dir.as_str());
    let bids = matlab_string(options.bids_dir.as_str());
    let substitutions = match stage {
        Stage::Setup => Substitutions::new()
            .with(
                "PROJECT_DIR         = '/path/to/project/directory'",
                format!("PROJECT_DIR         = {project}"),
            )
            .with(
                "BIDS_DIR            = '/path/to/bids/dataset'",
                format!("BIDS_DIR            = {bids}"),
            )
            .with(
                "NSUBJECTS           = 30",
                format!("NSUBJECTS           = {}", params.num_subjects),
            )
            .with(
                "REPETITION_TIME     = 2.0",
                format!("REPETITION_TIME     = {}", matlab_float(params.tr)),
            ),
        Stage::Import => Substitutions::new()
            .with(
                "PROJECT_DIR     = '/path/to/project/directory'",
                format!("PROJECT_DIR     = {project}"),
            )
            .with(
                "BIDS_DIR        = '/path/to/bids/dataset'",
                format!("BIDS_DIR        = {bids}"),
            )
            .with(
                "FMRIPREP_DIR    = '/path/to/fmriprep/dataset'",
                format!(
                    "FMRIPREP_DIR    = {}",
                    matlab_string(options.derivatives_dir.as_str())
                ),
            ),
        Stage::Smooth => Substitutions::new()
            .with(
                "PROJECT_DIR     = '/path/to/project/directory'",
                format!("PROJECT_DIR     = {project}"),
            )
            .with(
                "VOLUME_SMOOTHING_FWHM    = 8",
                format!("VOLUME_SMOOTHING_FWHM    = {}", options.fwhm),
            ),
        Stage::Denoise => Substitutions::new()
            .with(
                "PROJECT_DIR     = '/path/to/project/directory'",
                format!("PROJECT_DIR     = {project}"),
            )
            .with(
                "GENERATE_QA_PLOTS = true",
                format!("GENERATE_QA_PLOTS = {}", options.generate_qa),
            ),
    };

    StagePlan {
        stage,
        template_path: options.template_dir.join(stage.template_file()),
        output_path: options.project_dir.join(stage.output_file()),
        substitutions,
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StageReport {
    pub stage: Stage,
    pub index: u8,
    pub name: &'static str,
    pub script: Utf8PathBuf,
    pub command_line: String,
    pub exit_code: Option<i32>,
    pub outcome: StageOutcome,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineReport {
    pub project_dir: Utf8PathBuf,
    pub log_file: Utf8PathBuf,
    pub parameters: Option<RunParameters>,
    pub stages: Vec<StageReport>,
}

pub struct Pipeline<E: StageExecutor> {
    options: PipelineOptions,
    executor: E,
    validator: DerivativeValidator,
    template: LiteralTemplate,
    interrupt: Arc<AtomicBool>,
}

impl<E: StageExecutor> Pipeline<E> {
    pub fn new(options: PipelineOptions, executor: E, validator: DerivativeValidator) -> Self {
        Self {
            options,
            executor,
            validator,
            template: LiteralTemplate,
            interrupt: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_interrupt(self, flag: Arc<AtomicBool>) -> Self {
        Self {
            validator: self.validator.with_interrupt(Arc::clone(&flag)),
            interrupt: flag,
            ..self
        }
    }

    pub fn run(&self, sink: &dyn ProgressSink) -> Result<PipelineReport, ConnError> {
        let options = &self.options;
        let mut report = PipelineReport {
            project_dir: options.project_dir.clone(),
            log_file: options.log_file(),
            parameters: None,
            stages: Vec::new(),
        };
        if options.all_skipped() {
            sink.event(ProgressEvent::info("All steps skipped, nothing to run."));
            return Ok(report);
        }

        if !options.project_dir.is_dir() {
            fs::create_dir_all(&options.project_dir).map_err(|err| {
                ConnError::Filesystem(format!("create {}: {err}", options.project_dir))
            })?;
            sink.event(ProgressEvent::info(format!(
                "Created project directory: {}",
                options.project_dir
            )));
        }
        paths::require_dir("fMRIprep directory", &options.derivatives_dir)?;
        paths::require_dir("BIDS directory", &options.bids_dir)?;

        let params = RunParameters::from_dataset(&options.bids_dir, sink);
        for stage in options.enabled_stages() {
            self.check_interrupt()?;
            let stage_report = self.run_stage(stage, &params, sink)?;
            report.stages.push(stage_report);
        }
        self.check_interrupt()?;

        report.parameters = Some(params);
        Ok(report)
    }

    fn run_stage(
        &self,
        stage: Stage,
        params: &RunParameters,
        sink: &dyn ProgressSink,
    ) -> Result<StageReport, ConnError> {
        let options = &self.options;
        sink.event(ProgressEvent::stage(format!(
            "Step {}: {}",
            stage.index(),
            stage.name()
        )));
        sink.event(ProgressEvent::info("=".repeat(70)));

        let plan = plan_stage(stage, options, params);
        if let Err(err) =
            self.template
                .write_script(&plan.template_path, &plan.output_path, &plan.substitutions)
        {
            sink.event(ProgressEvent::error(format!(
                "Failed to create MATLAB script: {err}"
            )));
            return Err(err);
        }
        debug!("wrote {}", plan.output_path);

        if stage == Stage::Import {
            self.validator.gate(&options.derivatives_dir, sink)?;
        }

        let execution = self.executor.execute(
            &plan.output_path,
            &mut |line: &str| sink.event(ProgressEvent::raw(line)),
            &self.interrupt,
        )?;
        self.check_interrupt()?;

        let outcome = execution.outcome();
        if outcome == StageOutcome::Failed {
            sink.event(ProgressEvent::error(format!("Step {} FAILED", stage.index())));
            self.record_failure(stage, &execution, params)?;
            return Err(ConnError::StageFailed {
                index: stage.index(),
                name: stage.name(),
                log_file: options.log_file(),
            });
        }

        sink.event(ProgressEvent::success(format!(
            "Step {} COMPLETED",
            stage.index()
        )));
        Ok(StageReport {
            stage,
            index: stage.index(),
            name: stage.name(),
            script: plan.output_path,
            command_line: execution.command_line,
            exit_code: execution.exit_code,
            outcome,
        })
    }

    fn record_failure(
        &self,
        stage: Stage,
        execution: &StageExecution,
        params: &RunParameters,
    ) -> Result<(), ConnError> {
        let options = &self.options;
        let log_file = options.log_file();

        let mut record = String::new();
        let _ = write!(
            record,
            "\n[FAILED] Step {}: {}\nCommand: {}\n",
            stage.index(),
            stage.name(),
            execution.command_line
        );
        record.push_str(&execution.output);
        diagnostics::append_to_log(&log_file, &record)?;
        diagnostics::append_conn_project_logs(&options.project_dir, &log_file)?;

        if stage != Stage::Import {
            return Ok(());
        }
        let Some((subject, session)) =
            diagnostics::extract_failure_subject_session(&execution.output)
        else {
            return Ok(());
        };
        if let Some(found) = SubjectDiagnostics::collect(
            &options.derivatives_dir,
            subject,
            session,
            &params.sessions,
        ) {
            diagnostics::append_to_log(&log_file, &found.render())?;
        }
        Ok(())
    }

    fn check_interrupt(&self) -> Result<(), ConnError> {
        if self.interrupt.load(Ordering::SeqCst) {
            Err(ConnError::Interrupted)
        } else {
            Ok(())
        }
    }
}
