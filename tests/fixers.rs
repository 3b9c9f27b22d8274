use std::fs;
use std::sync::Mutex;

use assert_matches::assert_matches;
use camino::{Utf8Path, Utf8PathBuf};
use serde_json::{Value, json};
use tempfile::TempDir;

use kira_dcm2bids::config::{ConfigLoader, ConfigOverrides, StudyConfig};
use kira_dcm2bids::error::KiraError;
use kira_dcm2bids::runner::{StageResult, StageRunner, StageStatus};
use kira_dcm2bids::stage::{StageLog, StageOptions, StageRegistry};
use kira_dcm2bids::tools::{CommandRunner, ExternalCommand};
use kira_dcm2bids::unit::UnitOfWork;

/// Fails the test if a stage shells out.
struct NoTools;

impl CommandRunner for NoTools {
    fn run(&self, command: &ExternalCommand, _log: &StageLog) -> Result<Option<i32>, KiraError> {
        panic!("unexpected command: {}", command.display());
    }
}

fn study(extra: Value) -> (TempDir, StudyConfig) {
    let temp = tempfile::tempdir().unwrap();
    let root = Utf8Path::from_path(temp.path()).unwrap();
    fs::create_dir_all(root.join("code")).unwrap();
    fs::write(root.join("code/heuristic.py"), "t = '{session}'").unwrap();
    let mut raw = json!({
        "heuristic": "code/heuristic.py",
        "epi_ap_phase_enc_dir": "j-",
        "orientation": "LPI",
        "slice_order": "odd",
        "slice_direction": 3
    });
    if let (Some(raw), Some(extra)) = (raw.as_object_mut(), extra.as_object()) {
        raw.extend(extra.clone());
    }
    fs::write(root.join("code/config.json"), raw.to_string()).unwrap();
    let config = ConfigLoader::resolve(root, &ConfigOverrides::default()).unwrap();
    (temp, config)
}

fn write(path: &Utf8Path, content: &str) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, content).unwrap();
}

/// Writes an image and, when given, its sidecar under the unit's `dir`.
fn image(unit: &UnitOfWork, dir: &str, stem: &str, sidecar: Option<&str>) -> Utf8PathBuf {
    let base = unit.rawdata_dir().join(dir);
    let path = base.join(format!("{}_{stem}.nii.gz", unit.prefix()));
    write(&path, "image");
    if let Some(sidecar) = sidecar {
        write(&base.join(format!("{}_{stem}.json", unit.prefix())), sidecar);
    }
    path
}

fn json_at(unit: &UnitOfWork, dir: &str, stem: &str) -> Utf8PathBuf {
    unit.rawdata_dir()
        .join(dir)
        .join(format!("{}_{stem}.json", unit.prefix()))
}

fn read_json(path: &Utf8Path) -> Value {
    serde_json::from_str(&fs::read_to_string(path).unwrap()).unwrap()
}

fn run(stage: &str, unit: &UnitOfWork, config: &StudyConfig) -> StageResult {
    run_with(&NoTools, stage, unit, config, false)
}

fn run_with(
    tools: &dyn CommandRunner,
    stage: &str,
    unit: &UnitOfWork,
    config: &StudyConfig,
    force: bool,
) -> StageResult {
    let options = StageOptions::default();
    let runner = StageRunner::new(tools, &options);
    let stage = StageRegistry::global().get(stage).unwrap();
    runner.run(stage, unit, config, force)
}

/// Answers `-h` with a version banner; a conversion writes one echo image
/// and sidecar named after `-f` into `-o`.
struct FakeDcm2niix {
    version: &'static str,
    calls: Mutex<Vec<ExternalCommand>>,
}

impl FakeDcm2niix {
    fn new(version: &'static str) -> Self {
        Self {
            version,
            calls: Mutex::new(Vec::new()),
        }
    }

    fn conversions(&self) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|command| command.args.iter().any(|arg| arg == "-f"))
            .count()
    }
}

impl CommandRunner for FakeDcm2niix {
    fn run(&self, command: &ExternalCommand, log: &StageLog) -> Result<Option<i32>, KiraError> {
        self.calls.lock().unwrap().push(command.clone());
        assert_eq!(command.program, "dcm2niix");
        if command.args == ["-h"] {
            log.info(format_args!("Chris Rorden's dcm2niiX version {}", self.version));
            return Ok(Some(0));
        }
        let value = |flag: &str| {
            let index = command.args.iter().position(|arg| arg == flag).unwrap();
            command.args[index + 1].clone()
        };
        let out = Utf8PathBuf::from(value("-o"));
        let name = value("-f");
        fs::write(out.join(format!("{name}_e1.nii.gz")), "image").unwrap();
        fs::write(
            out.join(format!("{name}_e1.json")),
            r#"{"AcquisitionDateTime": "2022-12-30T10:27:53.770000"}"#,
        )
        .unwrap();
        Ok(Some(0))
    }
}

#[test]
fn fixfmap_renames_and_links_bold_runs() {
    let (_temp, config) = study(json!({}));
    let unit = UnitOfWork::describe(&config.root, "S01", "MR1").unwrap();
    image(&unit, "fmap", "run-1_b0-combined1", Some(r#"{"EchoTime": 0.005}"#));
    image(&unit, "fmap", "run-1_b0-combined2", Some(r#"{"EchoTime": 0.005}"#));
    image(&unit, "func", "task-rest_bold", Some("{}"));
    write(
        &unit.scans_tsv(),
        &format!(
            "filename\tacq_time\nfmap/{}_run-1_b0-combined2.nii.gz\t2024-01-01T09:00:00\n",
            unit.prefix()
        ),
    );

    let result = run("fixfmap", &unit, &config);
    assert_eq!(result.status, StageStatus::Success, "{:?}", result.error);

    let magnitude = unit
        .rawdata_dir()
        .join("fmap")
        .join(format!("{}_acq-b0_run-1_magnitude.nii.gz", unit.prefix()));
    assert!(magnitude.as_std_path().exists());
    assert!(!json_at(&unit, "fmap", "run-1_b0-combined1").as_std_path().exists());

    let fieldmap = read_json(&json_at(&unit, "fmap", "acq-b0_run-1_fieldmap"));
    assert_eq!(fieldmap["Units"], json!("rad/s"));
    assert_eq!(
        fieldmap["IntendedFor"],
        json!(["ses-MR1/func/sub-S01_ses-MR1_task-rest_bold.nii.gz"])
    );
    assert_eq!(fieldmap["EchoTime"], json!(0.005));
    let magnitude_json = read_json(&json_at(&unit, "fmap", "acq-b0_run-1_magnitude"));
    assert!(magnitude_json.get("Units").is_none());

    let scans = fs::read_to_string(unit.scans_tsv()).unwrap();
    assert!(scans.contains("fmap/sub-S01_ses-MR1_acq-b0_run-1_fieldmap.nii.gz\t2024-01-01T09:00:00"));

    let before = fs::read(json_at(&unit, "fmap", "acq-b0_run-1_fieldmap")).unwrap();
    assert_eq!(run("fixfmap", &unit, &config).status, StageStatus::Skipped);
    assert_eq!(
        fs::read(json_at(&unit, "fmap", "acq-b0_run-1_fieldmap")).unwrap(),
        before
    );
}

#[test]
fn fixfmap_leaves_an_existing_target_alone() {
    let (_temp, config) = study(json!({}));
    let unit = UnitOfWork::describe(&config.root, "S01", "MR1").unwrap();
    let scanner = image(&unit, "fmap", "run-1_b0-combined1", Some("{}"));
    image(&unit, "fmap", "acq-b0_run-1_magnitude", Some("{}"));

    let result = run("fixfmap", &unit, &config);
    assert_eq!(result.status, StageStatus::Skipped);
    assert!(scanner.as_std_path().exists());
}

fn mp2rage_block() -> Value {
    json!({
        "RepetitionTimeExcitation": 0.0067,
        "RepetitionTimePreparation": 5.0,
        "InversionTime": [0.9, 2.75],
        "NumberShots": 176,
        "FlipAngle": [4, 5]
    })
}

#[test]
fn fixanat_names_inversions_and_merges_mp2rage_file() {
    let (temp, _) = study(json!({}));
    let root = Utf8Path::from_path(temp.path()).unwrap();
    fs::write(root.join("code/mp2rage.json"), mp2rage_block().to_string()).unwrap();
    let config = ConfigLoader::resolve(root, &ConfigOverrides::default()).unwrap();
    let unit = UnitOfWork::describe(&config.root, "S01", "MR1").unwrap();
    image(&unit, "anat", "run-1_MP2RAGE_inv1", Some(r#"{"EchoTime": 0.003}"#));
    image(&unit, "anat", "run-1_MP2RAGE_inv2", None);
    image(&unit, "anat", "acq-mp2rage_run-1_UNIT1", Some("{}"));

    let result = run("fixanat", &unit, &config);
    assert_eq!(result.status, StageStatus::Success, "{:?}", result.error);

    let inv1 = read_json(&json_at(&unit, "anat", "run-1_inv-1_MP2RAGE"));
    assert_eq!(inv1["InversionTime"], json!(0.9));
    assert_eq!(inv1["FlipAngle"], json!(4));
    assert_eq!(inv1["NumberShots"], json!(176));
    assert_eq!(inv1["EchoTime"], json!(0.003));

    // the second inversion had no sidecar and gets one
    let inv2 = read_json(&json_at(&unit, "anat", "run-1_inv-2_MP2RAGE"));
    assert_eq!(inv2["InversionTime"], json!(2.75));

    let unit1 = read_json(&json_at(&unit, "anat", "acq-mp2rage_run-1_UNIT1"));
    assert_eq!(unit1["RepetitionTimePreparation"], json!(5.0));
    assert!(unit1.get("InversionTime").is_none());

    assert_eq!(run("fixanat", &unit, &config).status, StageStatus::Skipped);
}

#[test]
fn fixanat_rejects_a_malformed_block() {
    let (_temp, config) = study(json!({"mp2rage": {"InversionTime": [0.9]}}));
    let unit = UnitOfWork::describe(&config.root, "S01", "MR1").unwrap();
    image(&unit, "anat", "run-1_inv-1_MP2RAGE", Some("{}"));

    let result = run("fixanat", &unit, &config);
    assert_eq!(result.status, StageStatus::Failed);
    assert_matches!(result.error, Some(KiraError::ConfigValidation { violations, .. }) => {
        assert!(violations.iter().any(|v| v.contains("mp2rage.NumberShots")));
    });
}

#[test]
fn fixanat_without_block_only_renames() {
    let (_temp, config) = study(json!({}));
    let unit = UnitOfWork::describe(&config.root, "S01", "MR1").unwrap();
    image(&unit, "anat", "T2star_e2", Some("{}"));

    let result = run("fixanat", &unit, &config);
    assert_eq!(result.status, StageStatus::Success, "{:?}", result.error);
    assert!(json_at(&unit, "anat", "echo-2_T2star").as_std_path().exists());
    let log = fs::read_to_string(unit.stage_log("fixanat")).unwrap();
    assert!(log.contains(" - WARNING - no mp2rage metadata"));
}

#[test]
fn fixepi_sets_directions_from_ap_token() {
    let (_temp, config) = study(json!({"total_readout_time": 0.0345}));
    let unit = UnitOfWork::describe(&config.root, "S01", "MR1").unwrap();
    image(&unit, "fmap", "acq-gre_dir-PA_run-1_epi", Some("{}"));
    image(&unit, "fmap", "acq-gre_dir-AP_run-1_epi", Some("{}"));
    image(&unit, "func", "task-rest_bold", Some(r#"{"PhaseEncodingDirection": "i"}"#));

    let result = run("fixepi", &unit, &config);
    assert_eq!(result.status, StageStatus::Success, "{:?}", result.error);

    let pa = read_json(&json_at(&unit, "fmap", "acq-gre_dir-PA_run-1_epi"));
    assert_eq!(pa["PhaseEncodingDirection"], json!("j"));
    assert_eq!(pa["TotalReadoutTime"], json!(0.0345));
    let ap = read_json(&json_at(&unit, "fmap", "acq-gre_dir-AP_run-1_epi"));
    assert_eq!(ap["PhaseEncodingDirection"], json!("j-"));
    let bold = read_json(&json_at(&unit, "func", "task-rest_bold"));
    assert_eq!(bold["PhaseEncodingDirection"], json!("j-"));

    assert_eq!(run("fixepi", &unit, &config).status, StageStatus::Skipped);
}

#[test]
fn b1_moves_maps_into_fmap() {
    let (_temp, config) = study(json!({}));
    let unit = UnitOfWork::describe(&config.root, "S01", "MR1").unwrap();
    let source = image(&unit, "anat", "run-1_b1-combined", None);

    let result = run("b1", &unit, &config);
    assert_eq!(result.status, StageStatus::Success, "{:?}", result.error);
    assert!(!source.as_std_path().exists());

    let target = unit
        .rawdata_dir()
        .join("fmap")
        .join(format!("{}_acq-dream_run-1_TB1map.nii.gz", unit.prefix()));
    assert!(target.as_std_path().exists());
    let sidecar = json_at(&unit, "fmap", "acq-dream_run-1_TB1map");
    assert_eq!(read_json(&sidecar), json!({}));

    assert_eq!(run("b1", &unit, &config).status, StageStatus::Skipped);
}

#[test]
fn b1_numbers_maps_that_share_a_name() {
    let (_temp, config) = study(json!({}));
    let unit = UnitOfWork::describe(&config.root, "S01", "MR1").unwrap();
    let first = image(&unit, "anat", "acq-dream_B1map_e1", Some(r#"{"EchoTime": 1}"#));
    let second = image(&unit, "anat", "acq-dream_B1map_e2", Some(r#"{"EchoTime": 2}"#));

    let result = run("b1", &unit, &config);
    assert_eq!(result.status, StageStatus::Success, "{:?}", result.error);
    assert!(!first.as_std_path().exists());
    assert!(!second.as_std_path().exists());
    assert_eq!(
        read_json(&json_at(&unit, "fmap", "acq-dream_run-1_TB1map")),
        json!({"EchoTime": 1})
    );
    assert_eq!(
        read_json(&json_at(&unit, "fmap", "acq-dream_run-2_TB1map")),
        json!({"EchoTime": 2})
    );

    assert_eq!(run("b1", &unit, &config).status, StageStatus::Skipped);
}

#[test]
fn b1_refuses_two_maps_for_one_target() {
    let (_temp, config) = study(json!({}));
    let unit = UnitOfWork::describe(&config.root, "S01", "MR1").unwrap();
    let anat = image(&unit, "anat", "run-1_b1-combined", Some("{}"));
    let func = image(&unit, "func", "run-1_b1-combined", Some("{}"));

    let result = run("b1", &unit, &config);
    assert_eq!(result.status, StageStatus::Failed);
    assert_matches!(result.error, Some(KiraError::RenameConflict { target, sources }) => {
        assert!(target.as_str().ends_with("fmap/sub-S01_ses-MR1_acq-dream_run-1_TB1map.nii.gz"));
        assert_eq!(sources, vec![anat.clone(), func.clone()]);
    });
    assert!(anat.as_std_path().exists());
    assert!(func.as_std_path().exists());
    assert!(!unit.rawdata_dir().join("fmap").as_std_path().exists());
}

#[test]
fn b1_converts_sourcedata_series_with_dcm2niix() {
    let (_temp, config) = study(json!({"b1": {"B1mapNominalFAValue": 60}}));
    let unit = UnitOfWork::describe(&config.root, "S01", "MR1").unwrap();
    for series in ["1301_B1map_dream", "1302_b1map_dream", "1401_T1w"] {
        write(&unit.sourcedata_dir().join(series).join("0001.dcm"), "dicom");
    }
    // heudiconv output is left alone when sourcedata has the series
    let heudiconv = image(&unit, "anat", "run-1_b1-combined", None);
    let tools = FakeDcm2niix::new("v1.0.20250505");

    let result = run_with(&tools, "b1", &unit, &config, false);
    assert_eq!(result.status, StageStatus::Success, "{:?}", result.error);
    assert_eq!(tools.conversions(), 2);
    assert!(heudiconv.as_std_path().exists());

    let calls = tools.calls.lock().unwrap().clone();
    assert_eq!(calls[0].args, vec!["-h".to_string()]);
    let fmap = unit.rawdata_dir().join("fmap");
    assert_eq!(
        calls[1].display(),
        format!(
            "dcm2niix -b y -z y -p n -f sub-S01_ses-MR1_acq-dream_run-1_TB1map -o {fmap} {}",
            unit.sourcedata_dir().join("1301_B1map_dream")
        )
    );

    for run in ["run-1", "run-2"] {
        let sidecar = json_at(&unit, "fmap", &format!("acq-dream_{run}_TB1map_e1"));
        assert_eq!(
            read_json(&sidecar),
            json!({
                "AcquisitionDateTime": "2022-12-30T10:27:53.770000",
                "B1mapNominalFAValue": 60
            })
        );
    }
    let scans = fs::read_to_string(unit.scans_tsv()).unwrap();
    assert_eq!(
        scans,
        "filename\tacq_time\n\
         fmap/sub-S01_ses-MR1_acq-dream_run-1_TB1map_e1.nii.gz\t2022-12-30T10:27:53.770000\n\
         fmap/sub-S01_ses-MR1_acq-dream_run-2_TB1map_e1.nii.gz\t2022-12-30T10:27:53.770000\n"
    );
    let log = fs::read_to_string(unit.stage_log("b1")).unwrap();
    assert!(log.contains(" - WARNING - dcm2niix v1.0.202505"));

    assert_eq!(run_with(&tools, "b1", &unit, &config, false).status, StageStatus::Skipped);
    let forced = run_with(&tools, "b1", &unit, &config, true);
    assert_eq!(forced.status, StageStatus::Success, "{:?}", forced.error);
    assert_eq!(tools.conversions(), 4);
    assert_eq!(fs::read_to_string(unit.scans_tsv()).unwrap(), scans);
}

#[cfg(unix)]
#[test]
fn rewritten_files_keep_readable_permissions() {
    use std::os::unix::fs::PermissionsExt;

    let (_temp, config) = study(json!({}));
    let unit = UnitOfWork::describe(&config.root, "S01", "MR1").unwrap();
    image(&unit, "anat", "run-1_b1-combined", None);
    let scans = unit.scans_tsv();
    write(
        &scans,
        "filename\tacq_time\nanat/sub-S01_ses-MR1_run-1_b1-combined.nii.gz\tn/a\n",
    );
    fs::set_permissions(&scans, fs::Permissions::from_mode(0o664)).unwrap();

    let result = run("b1", &unit, &config);
    assert_eq!(result.status, StageStatus::Success, "{:?}", result.error);

    let mode = |path: &Utf8Path| fs::metadata(path).unwrap().permissions().mode() & 0o777;
    // a plain new file gets the process umask default
    let reference = unit.rawdata_dir().join("fmap/reference");
    write(&reference, "");
    let sidecar = json_at(&unit, "fmap", "acq-dream_run-1_TB1map");
    assert_eq!(mode(&sidecar), mode(&reference));
    assert_eq!(mode(&scans), 0o664);
    assert!(
        fs::read_to_string(&scans)
            .unwrap()
            .contains("fmap/sub-S01_ses-MR1_acq-dream_run-1_TB1map.nii.gz")
    );
}
