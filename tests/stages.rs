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

const IDENTITY: [[f32; 4]; 3] = [
    [1.0, 0.0, 0.0, 0.0],
    [0.0, 1.0, 0.0, 0.0],
    [0.0, 0.0, 1.0, 0.0],
];

const SWAPPED: [[f32; 4]; 3] = [
    [0.0, 0.0, -1.0, 0.0],
    [1.0, 0.0, 0.0, 0.0],
    [0.0, 1.0, 0.0, 0.0],
];

/// A little-endian NIfTI-1 header with unit voxel sizes.
fn synthetic_header(dims: [i16; 4], srow: Option<[[f32; 4]; 3]>) -> Vec<u8> {
    let mut bytes = vec![0u8; 348 + 4];
    bytes[0..4].copy_from_slice(&348i32.to_le_bytes());
    let ndim: i16 = if dims[3] > 1 { 4 } else { 3 };
    bytes[40..42].copy_from_slice(&ndim.to_le_bytes());
    for (i, value) in dims.iter().enumerate() {
        let offset = 42 + 2 * i;
        bytes[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
    }
    for i in 0..4 {
        let offset = 76 + 4 * i;
        bytes[offset..offset + 4].copy_from_slice(&1.0f32.to_le_bytes());
    }
    if let Some(srow) = srow {
        bytes[254..256].copy_from_slice(&1i16.to_le_bytes());
        for (row, values) in srow.iter().enumerate() {
            for (col, value) in values.iter().enumerate() {
                let offset = 280 + 16 * row + 4 * col;
                bytes[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
            }
        }
    }
    bytes[344..348].copy_from_slice(b"n+1\0");
    bytes
}

type Script = Box<dyn Fn(&ExternalCommand, usize) -> Option<i32> + Send + Sync>;

/// Plays the part of an external tool: records each command and lets the
/// script produce its outputs. The script also sees the call index.
struct Scripted {
    script: Script,
    calls: Mutex<Vec<ExternalCommand>>,
}

impl Scripted {
    fn new(script: impl Fn(&ExternalCommand, usize) -> Option<i32> + Send + Sync + 'static) -> Self {
        Self {
            script: Box::new(script),
            calls: Mutex::new(Vec::new()),
        }
    }

    fn displays(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(ExternalCommand::display)
            .collect()
    }
}

impl CommandRunner for Scripted {
    fn run(&self, command: &ExternalCommand, log: &StageLog) -> Result<Option<i32>, KiraError> {
        let index = {
            let mut calls = self.calls.lock().unwrap();
            calls.push(command.clone());
            calls.len() - 1
        };
        log.info(format_args!("fake {}", command.program));
        Ok((self.script)(command, index))
    }
}

fn study() -> (TempDir, StudyConfig) {
    let temp = tempfile::tempdir().unwrap();
    let root = Utf8Path::from_path(temp.path()).unwrap();
    fs::create_dir_all(root.join("code")).unwrap();
    fs::write(root.join("code/heuristic.py"), "t = 'sub-{subject}_ses-{session}'").unwrap();
    fs::write(
        root.join("code/config.json"),
        json!({
            "heuristic": "code/heuristic.py",
            "epi_ap_phase_enc_dir": "j-",
            "orientation": "LPI",
            "slice_order": "odd",
            "slice_direction": 3
        })
        .to_string(),
    )
    .unwrap();
    let config = ConfigLoader::resolve(root, &ConfigOverrides::default()).unwrap();
    (temp, config)
}

fn write(path: &Utf8Path, content: &[u8]) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, content).unwrap();
}

fn run_stage(
    name: &str,
    tools: &Scripted,
    options: &StageOptions,
    unit: &UnitOfWork,
    config: &StudyConfig,
) -> StageResult {
    let runner = StageRunner::new(tools, options);
    runner.run(StageRegistry::global().get(name).unwrap(), unit, config, false)
}

fn arg_after<'a>(command: &'a ExternalCommand, flag: &str) -> &'a str {
    let index = command.args.iter().position(|arg| arg == flag).unwrap();
    &command.args[index + 1]
}

#[test]
fn src2rawdata_converts_and_tidies_the_session() {
    let (_temp, config) = study();
    let unit = UnitOfWork::describe(&config.root, "S01", "MR1").unwrap();
    write(&unit.sourcedata_dir().join("301_T1w/IM_00001.dcm"), b"dicom");

    let rawdata = unit.rawdata_dir();
    let cache = unit.rawdata_root().join(".heudiconv/S01");
    let produced = rawdata.clone();
    let cache_dir = cache.clone();
    let tools = Scripted::new(move |_, _| {
        write(&produced.join("anat/sub-S01_ses-MR1_T1w.nii.gz"), b"image");
        write(&produced.join("dwi/sub-S01_ses-MR1_dwi.nii.gz"), b"image");
        write(&produced.join("dwi/sub-S01_ses-MR1_ADC.nii.gz"), b"image");
        write(&produced.join("dwi/sub-S01_ses-MR1_ADC.json"), b"{}");
        write(&cache_dir.join("info/filegroup.json"), b"{}");
        Some(0)
    });
    let options = StageOptions {
        notop: true,
        ..StageOptions::default()
    };

    let result = run_stage("src2rawdata", &tools, &options, &unit, &config);
    assert_eq!(result.status, StageStatus::Success, "{:?}", result.error);
    assert!(rawdata.join("dwi/sub-S01_ses-MR1_dwi.nii.gz").as_std_path().exists());
    assert!(!rawdata.join("dwi/sub-S01_ses-MR1_ADC.nii.gz").as_std_path().exists());
    assert!(!rawdata.join("dwi/sub-S01_ses-MR1_ADC.json").as_std_path().exists());
    assert!(!cache.as_std_path().exists());

    let calls = tools.calls.lock().unwrap();
    assert_eq!(calls[0].program, "heudiconv");
    assert_eq!(
        arg_after(&calls[0], "-d"),
        format!("{}/sourcedata/sub-{{subject}}/ses-{{session}}/*/*.dcm", config.root)
    );
    assert_eq!(arg_after(&calls[0], "-s"), "S01");
    assert_eq!(arg_after(&calls[0], "-ss"), "MR1");
    assert!(calls[0].display().ends_with("-c dcm2niix -b notop --overwrite"));
}

#[test]
fn src2rawdata_in_docker_warns_about_sessionless_heuristic() {
    let (_temp, config) = study();
    fs::write(config.heuristic.as_std_path(), "t = 'sub-{subject}'").unwrap();
    let unit = UnitOfWork::describe(&config.root, "S01", "MR1").unwrap();
    write(&unit.sourcedata_dir().join("301_T1w/IM_00001.dcm"), b"dicom");

    let tools = Scripted::new(|_, _| Some(1));
    let options = StageOptions {
        use_docker: true,
        ..StageOptions::default()
    };
    let result = run_stage("src2rawdata", &tools, &options, &unit, &config);
    assert_eq!(result.exit_code, Some(1));
    assert_matches!(result.error, Some(KiraError::ExternalTool { .. }));

    let display = &tools.displays()[0];
    assert!(display.starts_with("docker run --rm"));
    assert!(display.contains(&format!("--volume {}:/base", config.root)));
    assert!(display.contains("nipy/heudiconv:latest -d /base/sourcedata/"));
    assert!(display.contains("-f /heuristic/heuristic.py -o /base/rawdata"));

    let log = fs::read_to_string(unit.stage_log("src2rawdata")).unwrap();
    assert!(log.contains(" - WARNING - heuristic "));
}

#[test]
fn src2rawdata_needs_sourcedata_and_heuristic() {
    let (_temp, config) = study();
    fs::remove_file(config.heuristic.as_std_path()).unwrap();
    let unit = UnitOfWork::describe(&config.root, "S01", "MR1").unwrap();
    let tools = Scripted::new(|_, _| Some(0));

    let result = run_stage("src2rawdata", &tools, &StageOptions::default(), &unit, &config);
    assert_matches!(result.error, Some(KiraError::Precondition { missing, .. }) => {
        assert_eq!(
            missing,
            vec![unit.sourcedata_dir().to_string(), config.heuristic.to_string()]
        );
    });
    assert!(tools.displays().is_empty());
}

/// The last argument of `fslswapdim` is its output basename.
fn write_swapped_output(command: &ExternalCommand) {
    let output = command.args.last().unwrap();
    write(
        &Utf8PathBuf::from(format!("{output}.nii")),
        &synthetic_header([64, 64, 36, 1], Some(IDENTITY)),
    );
}

#[test]
fn reorient_swaps_misoriented_images() {
    let (_temp, config) = study();
    let unit = UnitOfWork::describe(&config.root, "S01", "MR1").unwrap();
    let image = unit.rawdata_dir().join("anat/sub-S01_ses-MR1_T1w.nii");
    write(&image, &synthetic_header([36, 64, 64, 1], Some(SWAPPED)));
    let aligned = unit.rawdata_dir().join("func/sub-S01_ses-MR1_task-rest_bold.nii");
    write(&aligned, &synthetic_header([64, 64, 36, 10], Some(IDENTITY)));

    let tools = Scripted::new(|command, _| {
        write_swapped_output(command);
        Some(0)
    });
    let result = run_stage("reorient", &tools, &StageOptions::default(), &unit, &config);
    assert_eq!(result.status, StageStatus::Success, "{:?}", result.error);

    let calls = tools.calls.lock().unwrap();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].args[0], image.as_str());
    assert_eq!(&calls[0].args[1..4], &["LR", "PA", "IS"]);
    assert_eq!(
        calls[0].env,
        vec![("FSLOUTPUTTYPE".to_string(), "NIFTI".to_string())]
    );
    drop(calls);

    assert_eq!(
        run_stage("reorient", &tools, &StageOptions::default(), &unit, &config).status,
        StageStatus::Skipped
    );
}

#[test]
fn reorient_retries_with_first_axis_flipped() {
    let (_temp, config) = study();
    let unit = UnitOfWork::describe(&config.root, "S01", "MR1").unwrap();
    let image = unit.rawdata_dir().join("anat/sub-S01_ses-MR1_T1w.nii");
    write(&image, &synthetic_header([36, 64, 64, 1], Some(SWAPPED)));

    let tools = Scripted::new(|command, index| {
        if index == 0 {
            return Some(1);
        }
        write_swapped_output(command);
        Some(0)
    });
    let result = run_stage("reorient", &tools, &StageOptions::default(), &unit, &config);
    assert_eq!(result.status, StageStatus::Success, "{:?}", result.error);

    let displays = tools.displays();
    assert_eq!(displays.len(), 2);
    assert!(displays[1].contains(" RL PA IS "));
    let log = fs::read_to_string(unit.stage_log("reorient")).unwrap();
    assert!(log.contains("retrying with the first axis flipped"));
}

#[test]
fn slicetime_corrects_bold_and_records_timing() {
    let (_temp, config) = study();
    let unit = UnitOfWork::describe(&config.root, "S01", "MR1").unwrap();
    let func = unit.rawdata_dir().join("func");
    write(
        &func.join("sub-S01_ses-MR1_task-rest_bold.nii"),
        &synthetic_header([64, 64, 4, 10], Some(IDENTITY)),
    );
    write(
        &func.join("sub-S01_ses-MR1_task-rest_bold.json"),
        br#"{"RepetitionTime": 2.0, "TaskName": "rest"}"#,
    );
    // no RepetitionTime, never eligible
    write(
        &func.join("sub-S01_ses-MR1_task-motor_bold.nii"),
        &synthetic_header([64, 64, 4, 10], Some(IDENTITY)),
    );
    write(&func.join("sub-S01_ses-MR1_task-motor_bold.json"), b"{}");

    let tools = Scripted::new(|command, _| {
        let output = arg_after(command, "-o");
        write(
            &Utf8PathBuf::from(format!("{output}.nii")),
            &synthetic_header([64, 64, 4, 10], Some(IDENTITY)),
        );
        Some(0)
    });
    let result = run_stage("slicetime", &tools, &StageOptions::default(), &unit, &config);
    assert_eq!(result.status, StageStatus::Success, "{:?}", result.error);

    let displays = tools.displays();
    assert_eq!(displays.len(), 1);
    assert!(displays[0].ends_with("-r 2 -d 3 --odd"));

    let sidecar: Value = serde_json::from_str(
        &fs::read_to_string(func.join("sub-S01_ses-MR1_task-rest_bold.json")).unwrap(),
    )
    .unwrap();
    assert_eq!(sidecar["SliceTiming"], json!([0.0, 1.0, 0.5, 1.5]));
    assert_eq!(sidecar["TaskName"], json!("rest"));

    assert_eq!(
        run_stage("slicetime", &tools, &StageOptions::default(), &unit, &config).status,
        StageStatus::Skipped
    );
}

#[test]
fn qc_runs_mriqc_for_the_unit() {
    let (_temp, config) = study();
    let unit = UnitOfWork::describe(&config.root, "S01", "MR1").unwrap();
    fs::create_dir_all(unit.rawdata_dir()).unwrap();

    let reports = unit.mriqc_dir();
    let tools = Scripted::new(move |_, _| {
        write(&reports.join("sub-S01_ses-MR1_T1w.html"), b"<html></html>");
        Some(0)
    });
    let options = StageOptions {
        mem_gb: 16,
        ..StageOptions::default()
    };
    let result = run_stage("qc", &tools, &options, &unit, &config);
    assert_eq!(result.status, StageStatus::Success, "{:?}", result.error);

    let display = &tools.displays()[0];
    assert!(display.contains("nipreps/mriqc:latest /data /out participant"));
    assert!(display.contains("--participant_label S01 --session-id MR1"));
    assert!(display.ends_with("--verbose-reports --mem_gb 16"));
    assert_eq!(
        run_stage("qc", &tools, &options, &unit, &config).status,
        StageStatus::Skipped
    );
}
