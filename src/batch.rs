use std::collections::BTreeSet;

use camino::{Utf8Path, Utf8PathBuf};

use crate::config::StudyConfig;
use crate::error::KiraError;
use crate::fs_util;
use crate::pipeline::{Pipeline, PipelineOptions, PipelineReport};
use crate::runner::StageRunner;
use crate::stage::StageLog;
use crate::stages::docker_user;
use crate::stages::src2rawdata::HEUDICONV_IMAGE;
use crate::tools::{CommandRunner, ExternalCommand, run_checked};
use crate::unit::UnitOfWork;

/// Top-level files heudiconv writes into `rawdata/`.
pub const TEMPLATE_FILES: [&str; 4] = [
    "dataset_description.json",
    "README",
    "CHANGES",
    ".bidsignore",
];

const POPULATE_STAGE: &str = "populate-templates";

/// Every `sub-*/ses-*` pair found under `sourcedata/` or `rawdata/`, sorted
/// and without duplicates.
pub fn discover_units(root: &Utf8Path) -> Result<Vec<(String, String)>, KiraError> {
    let mut found = BTreeSet::new();
    for base in [root.join("sourcedata"), root.join("rawdata")] {
        for subject in labelled_dirs(&base, "sub-")? {
            let Some(subject_id) = subject.file_name().and_then(|name| name.strip_prefix("sub-"))
            else {
                continue;
            };
            for session in labelled_dirs(&subject, "ses-")? {
                if let Some(session_id) =
                    session.file_name().and_then(|name| name.strip_prefix("ses-"))
                {
                    found.insert((subject_id.to_string(), session_id.to_string()));
                }
            }
        }
    }
    Ok(found.into_iter().collect())
}

fn labelled_dirs(dir: &Utf8Path, prefix: &str) -> Result<Vec<Utf8PathBuf>, KiraError> {
    Ok(fs_util::list_dir(dir)?
        .into_iter()
        .filter(|path| path.as_std_path().is_dir())
        .filter(|path| {
            path.file_name()
                .map(|name| name.starts_with(prefix) && name.len() > prefix.len())
                .unwrap_or(false)
        })
        .collect())
}

#[derive(Debug)]
pub struct BatchEntry {
    pub subject: String,
    pub session: String,
    /// Absent when the identifiers were rejected before anything ran.
    pub report: Option<PipelineReport>,
    pub error: Option<KiraError>,
}

impl BatchEntry {
    pub fn is_failed(&self) -> bool {
        self.error.is_some()
    }

    pub fn label(&self) -> String {
        match &self.report {
            Some(report) => report.unit.clone(),
            None => format!("sub-{}_ses-{}", self.subject, self.session),
        }
    }
}

#[derive(Debug, Default)]
pub struct BatchReport {
    pub entries: Vec<BatchEntry>,
}

impl BatchReport {
    pub fn total(&self) -> usize {
        self.entries.len()
    }

    pub fn failed(&self) -> usize {
        self.entries.iter().filter(|entry| entry.is_failed()).count()
    }

    pub fn error(&self) -> Option<KiraError> {
        let failed = self.failed();
        (failed > 0).then(|| KiraError::BatchFailed {
            failed,
            total: self.total(),
        })
    }
}

/// Runs one pipeline over many units, one after another. A failing unit
/// never stops the units after it.
pub struct BatchDriver<'a, 'r> {
    pipeline: &'a Pipeline<'r>,
    runner: &'a StageRunner<'a>,
    config: &'a StudyConfig,
    options: PipelineOptions,
}

impl<'a, 'r> BatchDriver<'a, 'r> {
    pub fn new(
        pipeline: &'a Pipeline<'r>,
        runner: &'a StageRunner<'a>,
        config: &'a StudyConfig,
        options: PipelineOptions,
    ) -> Self {
        Self {
            pipeline,
            runner,
            config,
            options,
        }
    }

    pub fn run(&self, units: &[(String, String)]) -> BatchReport {
        let mut report = BatchReport::default();
        for (index, (subject, session)) in units.iter().enumerate() {
            tracing::info!(
                "[{}/{}] sub-{subject} ses-{session}",
                index + 1,
                units.len()
            );
            let entry = match UnitOfWork::describe(&self.config.root, subject, session) {
                Ok(unit) => {
                    let pipeline_report =
                        self.pipeline
                            .run(self.runner, &unit, self.config, self.options);
                    BatchEntry {
                        subject: unit.subject().to_string(),
                        session: unit.session().to_string(),
                        error: pipeline_report.error(),
                        report: Some(pipeline_report),
                    }
                }
                Err(err) => {
                    tracing::error!("skipping sub-{subject} ses-{session}: {err}");
                    BatchEntry {
                        subject: subject.clone(),
                        session: session.clone(),
                        report: None,
                        error: Some(err),
                    }
                }
            };
            report.entries.push(entry);
        }
        if report.failed() > 0 {
            tracing::warn!("{} of {} units failed", report.failed(), report.total());
        }
        report
    }
}

/// Writes the top-level BIDS files with heudiconv once every unit has been
/// converted with `--notop`. Returns the template files present afterwards.
pub fn populate_templates(
    config: &StudyConfig,
    tools: &dyn CommandRunner,
    use_docker: bool,
) -> Result<Vec<String>, KiraError> {
    let root = &config.root;
    let rawdata = root.join("rawdata");
    let heuristic = &config.heuristic;
    let missing = |what: String| KiraError::Precondition {
        stage: POPULATE_STAGE.to_string(),
        unit: root.to_string(),
        missing: vec![what],
    };
    if !heuristic.as_std_path().is_file() {
        return Err(missing(heuristic.to_string()));
    }
    let has_subjects = !labelled_dirs(&rawdata, "sub-")?.is_empty();
    if !has_subjects {
        return Err(missing(format!("{rawdata}/sub-*")));
    }

    let log_path = root
        .join("derivatives")
        .join("logs")
        .join("populate_templates.log");
    let log = StageLog::create(&log_path, POPULATE_STAGE)?;
    log.info(format_args!("populating BIDS templates for {root}"));

    let timeout = config.timeout_for(POPULATE_STAGE);
    let command = if use_docker || config.use_docker {
        let (Some(dir), Some(name)) = (heuristic.parent(), heuristic.file_name()) else {
            return Err(missing(heuristic.to_string()));
        };
        let mut command = ExternalCommand::new("docker")
            .timeout(timeout)
            .args(["run", "--rm"]);
        if let Some(user) = docker_user(root)? {
            command = command.arg("--user").arg(user);
        }
        command
            .arg("--volume")
            .arg(format!("{rawdata}:/rawdata"))
            .arg("--volume")
            .arg(format!("{dir}:/heuristic:ro"))
            .arg(HEUDICONV_IMAGE)
            .args(["--files", "/rawdata", "-f"])
            .arg(format!("/heuristic/{name}"))
            .args(["--command", "populate-templates"])
    } else {
        ExternalCommand::new("heudiconv")
            .timeout(timeout)
            .arg("--files")
            .arg(rawdata.as_str())
            .arg("-f")
            .arg(heuristic.as_str())
            .args(["--command", "populate-templates"])
    };
    run_checked(tools, &command, &log)?;

    let created: Vec<String> = TEMPLATE_FILES
        .iter()
        .filter(|name| rawdata.join(name).as_std_path().exists())
        .map(|name| name.to_string())
        .collect();
    for name in &created {
        log.info(format_args!("present: {name}"));
    }
    if !rawdata.join("participants.tsv").as_std_path().exists() {
        log.warn("participants.tsv was not created; add it by hand (participant_id, age, sex)");
    }
    Ok(created)
}
