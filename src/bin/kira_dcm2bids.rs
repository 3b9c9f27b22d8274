use std::process::ExitCode;

use camino::{Utf8Path, Utf8PathBuf};
use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use kira_dcm2bids::batch::{self, BatchDriver};
use kira_dcm2bids::config::{ConfigLoader, ConfigOverrides, SliceOrder, StudyConfig};
use kira_dcm2bids::error::KiraError;
use kira_dcm2bids::fs_util;
use kira_dcm2bids::locator;
use kira_dcm2bids::output::{
    BatchView, ConfigView, HumanOutput, InitView, JsonOutput, OutputMode, PipelineView,
    StageStateView, StatusView, TemplatesView,
};
use kira_dcm2bids::pipeline::{Pipeline, PipelineOptions, PipelineReport, canonical_order};
use kira_dcm2bids::runner::StageRunner;
use kira_dcm2bids::settings::SettingsStore;
use kira_dcm2bids::stage::{StageOptions, StageRegistry};
use kira_dcm2bids::tools::SystemCommandRunner;
use kira_dcm2bids::unit::{ModalityFilter, UnitOfWork};

#[derive(Parser)]
#[command(name = "kira-dcm2bids")]
#[command(about = "Resumable DICOM to BIDS conversion, one stage at a time")]
#[command(version, author)]
struct Cli {
    /// Study root; defaults to searching the working directory and its parents.
    #[arg(long, global = true)]
    studydir: Option<Utf8PathBuf>,

    /// Re-run stages even when their outputs already exist.
    #[arg(long, global = true)]
    force: bool,

    #[arg(long, short, global = true)]
    verbose: bool,

    /// Print results as JSON on stdout.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Organize DICOM input into sourcedata")]
    Dcm2src(StageCommand),
    #[command(about = "Convert sourcedata to BIDS rawdata with heudiconv")]
    Src2rawdata(StageCommand),
    #[command(about = "Convert or move B1 maps into fmap as TB1map")]
    B1(StageCommand),
    #[command(about = "Fix anatomical file names and MP2RAGE metadata")]
    Fixanat(StageCommand),
    #[command(about = "Fix fieldmap names, Units and IntendedFor")]
    Fixfmap(StageCommand),
    #[command(about = "Set PhaseEncodingDirection and TotalReadoutTime")]
    Fixepi(StageCommand),
    #[command(about = "Reorient images to the study orientation")]
    Reorient(StageCommand),
    #[command(about = "Slice-timing correction of BOLD runs")]
    Slicetime(StageCommand),
    #[command(about = "Run the BIDS validator")]
    Validate(StageCommand),
    #[command(about = "Run MRIQC participant reports")]
    Qc(StageCommand),
    #[command(about = "Run the whole pipeline for one session")]
    RunAll(RunAllArgs),
    #[command(about = "Run the pipeline for many sessions")]
    Batch(BatchArgs),
    #[command(about = "Show the study configuration and, for one session, its stage states")]
    Status(StatusArgs),
    #[command(about = "Register a study as the default for this user")]
    Init(InitArgs),
    #[command(about = "Write top-level BIDS files after a --notop batch")]
    PopulateTemplates(TemplatesArgs),
}

#[derive(Args, Clone)]
struct UnitArgs {
    #[arg(long, short = 's')]
    subject: String,

    #[arg(long)]
    session: String,
}

#[derive(Args, Clone)]
struct StageArgs {
    /// DICOM directory or zip archive (dcm2src).
    #[arg(long)]
    dicom_dir: Option<Utf8PathBuf>,

    /// Heuristic file, overriding config.json.
    #[arg(long)]
    heuristic: Option<String>,

    /// Run heudiconv in its container.
    #[arg(long)]
    use_docker: bool,

    /// Skip heudiconv's top-level BIDS files.
    #[arg(long)]
    notop: bool,

    /// AP phase-encoding direction (i, j, k with optional -).
    #[arg(long)]
    ap_phase_enc: Option<String>,

    /// Target orientation, e.g. LPI.
    #[arg(long)]
    orientation: Option<String>,

    #[arg(long, value_enum, default_value_t = ModalityFilter::All)]
    modality: ModalityFilter,

    #[arg(long, value_enum)]
    slice_order: Option<SliceOrder>,

    #[arg(long)]
    slice_direction: Option<u8>,

    /// Memory limit handed to MRIQC.
    #[arg(long, default_value_t = 8)]
    mem_gb: u32,
}

impl StageArgs {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            heuristic: self.heuristic.clone(),
            epi_ap_phase_enc_dir: self.ap_phase_enc.clone(),
            orientation: self.orientation.clone(),
            slice_order: self.slice_order,
            slice_direction: self.slice_direction,
        }
    }

    fn options(&self) -> StageOptions {
        StageOptions {
            dicom_dir: self.dicom_dir.clone(),
            use_docker: self.use_docker,
            notop: self.notop,
            modality: self.modality,
            mem_gb: self.mem_gb,
        }
    }
}

#[derive(Args, Clone)]
struct StageCommand {
    #[command(flatten)]
    unit: UnitArgs,

    #[command(flatten)]
    stage: StageArgs,
}

#[derive(Args, Clone)]
struct PipelineArgs {
    #[arg(long)]
    skip_validate: bool,

    #[arg(long)]
    with_qc: bool,

    /// Keep running the remaining stages after one fails.
    #[arg(long)]
    keep_going: bool,
}

#[derive(Args, Clone)]
struct RunAllArgs {
    #[command(flatten)]
    unit: UnitArgs,

    #[command(flatten)]
    stage: StageArgs,

    #[command(flatten)]
    pipeline: PipelineArgs,
}

#[derive(Args, Clone)]
struct BatchArgs {
    /// SUBJECT:SESSION pairs; discovered from sourcedata and rawdata when omitted.
    #[arg(long = "unit", value_parser = parse_unit_pair)]
    units: Vec<(String, String)>,

    #[command(flatten)]
    stage: StageArgs,

    #[command(flatten)]
    pipeline: PipelineArgs,
}

#[derive(Args, Clone)]
struct StatusArgs {
    /// With --session, also show which stages are complete for that unit.
    #[arg(long, short = 's', requires = "session")]
    subject: Option<String>,

    #[arg(long, requires = "subject")]
    session: Option<String>,

    #[command(flatten)]
    stage: StageArgs,
}

#[derive(Args, Clone)]
struct InitArgs {
    /// The study's code/config.json.
    #[arg(long)]
    config: Utf8PathBuf,
}

#[derive(Args, Clone)]
struct TemplatesArgs {
    #[arg(long)]
    heuristic: Option<String>,

    #[arg(long)]
    use_docker: bool,
}

fn parse_unit_pair(value: &str) -> Result<(String, String), String> {
    match value.split_once(':') {
        Some((subject, session)) if !subject.is_empty() && !session.is_empty() => {
            Ok((subject.to_string(), session.to_string()))
        }
        _ => Err(format!("expected SUBJECT:SESSION, got {value:?}")),
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    if let Err(report) = run(cli) {
        eprintln!("{report:?}");
        if let Some(kira) = report.downcast_ref::<KiraError>() {
            return ExitCode::from(kira.exit_code());
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

struct Invocation {
    studydir: Option<Utf8PathBuf>,
    force: bool,
    mode: OutputMode,
    cwd: Utf8PathBuf,
}

impl Invocation {
    fn study(&self, overrides: &ConfigOverrides) -> miette::Result<StudyConfig> {
        let settings = SettingsStore::new().ok();
        let root = locator::resolve_root(self.studydir.as_deref(), &self.cwd, settings.as_ref())?;
        Ok(ConfigLoader::resolve(&root, overrides)?)
    }
}

fn run(cli: Cli) -> miette::Result<()> {
    let cwd = fs_util::to_utf8(std::env::current_dir().into_diagnostic()?)?;
    let invocation = Invocation {
        studydir: cli.studydir,
        force: cli.force,
        mode: if cli.json {
            OutputMode::Json
        } else {
            OutputMode::Human
        },
        cwd,
    };

    match cli.command {
        Commands::Dcm2src(args) => run_stage(&invocation, "dcm2src", args),
        Commands::Src2rawdata(args) => run_stage(&invocation, "src2rawdata", args),
        Commands::B1(args) => run_stage(&invocation, "b1", args),
        Commands::Fixanat(args) => run_stage(&invocation, "fixanat", args),
        Commands::Fixfmap(args) => run_stage(&invocation, "fixfmap", args),
        Commands::Fixepi(args) => run_stage(&invocation, "fixepi", args),
        Commands::Reorient(args) => run_stage(&invocation, "reorient", args),
        Commands::Slicetime(args) => run_stage(&invocation, "slicetime", args),
        Commands::Validate(args) => run_stage(&invocation, "validate", args),
        Commands::Qc(args) => run_stage(&invocation, "qc", args),
        Commands::RunAll(args) => run_all(&invocation, args),
        Commands::Batch(args) => run_batch(&invocation, args),
        Commands::Status(args) => run_status(&invocation, args),
        Commands::Init(args) => run_init(&invocation, args),
        Commands::PopulateTemplates(args) => run_templates(&invocation, args),
    }
}

fn run_stage(invocation: &Invocation, name: &str, args: StageCommand) -> miette::Result<()> {
    let config = invocation.study(&args.stage.overrides())?;
    let unit = UnitOfWork::describe(&config.root, &args.unit.subject, &args.unit.session)?;
    let pipeline = Pipeline::select(StageRegistry::global(), &config, &[name])?;
    let options = PipelineOptions {
        force: invocation.force,
        stop_on_failure: true,
    };
    execute_pipeline(invocation, &pipeline, &unit, &config, &args.stage, options)
}

fn run_all(invocation: &Invocation, args: RunAllArgs) -> miette::Result<()> {
    let config = invocation.study(&args.stage.overrides())?;
    let unit = UnitOfWork::describe(&config.root, &args.unit.subject, &args.unit.session)?;
    let pipeline = full_pipeline(&config, &args.pipeline)?;
    let options = PipelineOptions {
        force: invocation.force,
        stop_on_failure: !args.pipeline.keep_going,
    };
    execute_pipeline(invocation, &pipeline, &unit, &config, &args.stage, options)
}

fn full_pipeline(
    config: &StudyConfig,
    args: &PipelineArgs,
) -> Result<Pipeline<'static>, KiraError> {
    let registry = StageRegistry::global();
    let mut pipeline = Pipeline::default_for(registry, config)?;
    if args.skip_validate {
        pipeline = pipeline.without("validate");
    }
    if args.with_qc {
        pipeline = pipeline.with(registry, config, "qc")?;
    }
    Ok(pipeline)
}

fn execute_pipeline(
    invocation: &Invocation,
    pipeline: &Pipeline<'_>,
    unit: &UnitOfWork,
    config: &StudyConfig,
    stage: &StageArgs,
    options: PipelineOptions,
) -> miette::Result<()> {
    let tools = SystemCommandRunner::new();
    let stage_options = stage.options();
    let runner = StageRunner::new(&tools, &stage_options);
    let report = pipeline.run(&runner, unit, config, options);
    emit_pipeline(invocation.mode, &report)?;
    match report.error() {
        Some(err) => Err(err.into()),
        None => Ok(()),
    }
}

fn emit_pipeline(mode: OutputMode, report: &PipelineReport) -> miette::Result<()> {
    let view = PipelineView::from(report);
    match mode {
        OutputMode::Json => JsonOutput::print(&view).into_diagnostic(),
        OutputMode::Human => {
            HumanOutput::print_pipeline(&view);
            Ok(())
        }
    }
}

fn run_batch(invocation: &Invocation, args: BatchArgs) -> miette::Result<()> {
    let config = invocation.study(&args.stage.overrides())?;
    let units = if args.units.is_empty() {
        batch::discover_units(&config.root)?
    } else {
        args.units.clone()
    };
    if units.is_empty() {
        tracing::warn!("no sub-*/ses-* directories under {}", config.root);
        return Ok(());
    }

    let pipeline = full_pipeline(&config, &args.pipeline)?;
    let tools = SystemCommandRunner::new();
    let stage_options = args.stage.options();
    let runner = StageRunner::new(&tools, &stage_options);
    let options = PipelineOptions {
        force: invocation.force,
        stop_on_failure: !args.pipeline.keep_going,
    };
    let report = BatchDriver::new(&pipeline, &runner, &config, options).run(&units);

    let view = BatchView::from(&report);
    match invocation.mode {
        OutputMode::Json => JsonOutput::print(&view).into_diagnostic()?,
        OutputMode::Human => HumanOutput::print_batch(&view),
    }

    if args.stage.notop && report.failed() < report.total() {
        let files = batch::populate_templates(&config, &tools, args.stage.use_docker)?;
        emit_templates(invocation.mode, &config.root, files)?;
    }
    match report.error() {
        Some(err) => Err(err.into()),
        None => Ok(()),
    }
}

fn run_status(invocation: &Invocation, args: StatusArgs) -> miette::Result<()> {
    let config = invocation.study(&args.stage.overrides())?;
    let mut view = StatusView {
        study: ConfigView::from(&config),
        unit: None,
        stages: Vec::new(),
    };

    if let (Some(subject), Some(session)) = (&args.subject, &args.session) {
        let unit = UnitOfWork::describe(&config.root, subject, session)?;
        let registry = StageRegistry::global();
        let tools = SystemCommandRunner::new();
        let stage_options = args.stage.options();
        let runner = StageRunner::new(&tools, &stage_options);
        for name in canonical_order(&config.b1_after) {
            let stage = registry.get(name)?;
            let state = runner.inspect(stage, &unit, &config)?;
            view.stages.push(StageStateView::new(name, &state));
        }
        view.unit = Some(unit.to_string());
    }

    match invocation.mode {
        OutputMode::Json => JsonOutput::print(&view).into_diagnostic(),
        OutputMode::Human => {
            HumanOutput::print_status(&view);
            Ok(())
        }
    }
}

fn run_init(invocation: &Invocation, args: InitArgs) -> miette::Result<()> {
    let config_path = if args.config.is_absolute() {
        args.config.clone()
    } else {
        invocation.cwd.join(&args.config)
    };
    let root = study_root(&config_path).ok_or_else(|| KiraError::InvalidStudyDir(config_path.clone()))?;
    let config = ConfigLoader::resolve(&root, &ConfigOverrides::default())?;

    let store = SettingsStore::new()?;
    let settings = store.register(&config_path)?;
    let view = InitView::new(store.path().to_path_buf(), &settings, &config);
    match invocation.mode {
        OutputMode::Json => JsonOutput::print(&view).into_diagnostic(),
        OutputMode::Human => {
            HumanOutput::print_init(&view);
            Ok(())
        }
    }
}

fn study_root(config_path: &Utf8Path) -> Option<Utf8PathBuf> {
    let code_dir = config_path.parent()?;
    if code_dir.file_name() != Some(locator::MARKER_DIR) {
        return None;
    }
    code_dir.parent().map(Utf8Path::to_path_buf)
}

fn run_templates(invocation: &Invocation, args: TemplatesArgs) -> miette::Result<()> {
    let overrides = ConfigOverrides {
        heuristic: args.heuristic.clone(),
        ..ConfigOverrides::default()
    };
    let config = invocation.study(&overrides)?;
    let tools = SystemCommandRunner::new();
    let files = batch::populate_templates(&config, &tools, args.use_docker)?;
    emit_templates(invocation.mode, &config.root, files)
}

fn emit_templates(mode: OutputMode, root: &Utf8Path, files: Vec<String>) -> miette::Result<()> {
    let view = TemplatesView {
        root: root.to_path_buf(),
        files,
    };
    match mode {
        OutputMode::Json => JsonOutput::print(&view).into_diagnostic(),
        OutputMode::Human => {
            HumanOutput::print_templates(&view);
            Ok(())
        }
    }
}
