#![cfg(unix)]

use std::fs;
use std::time::Duration;

use assert_matches::assert_matches;
use camino::Utf8Path;

use kira_dcm2bids::error::KiraError;
use kira_dcm2bids::stage::StageLog;
use kira_dcm2bids::tools::{CommandRunner, ExternalCommand, SystemCommandRunner, run_checked};

#[test]
fn output_goes_to_the_stage_log() {
    let temp = tempfile::tempdir().unwrap();
    let path = Utf8Path::from_path(temp.path()).unwrap().join("logs/reorient.log");
    let log = StageLog::create(&path, "reorient").unwrap();

    let command = ExternalCommand::new("sh").args(["-c", "echo converted; echo warned >&2; exit 3"]);
    let code = SystemCommandRunner::new().run(&command, &log).unwrap();
    assert_eq!(code, Some(3));

    let content = fs::read_to_string(&path).unwrap();
    assert!(content.contains(" - INFO - running: sh -c"));
    assert!(content.contains("converted\n"));
    assert!(content.contains("warned\n"));
}

#[test]
fn nonzero_exit_is_an_external_tool_error() {
    let temp = tempfile::tempdir().unwrap();
    let path = Utf8Path::from_path(temp.path()).unwrap().join("validate.log");
    let log = StageLog::create(&path, "validate").unwrap();

    let command = ExternalCommand::new("sh").args(["-c", "exit 2"]);
    assert_matches!(
        run_checked(&SystemCommandRunner::new(), &command, &log),
        Err(KiraError::ExternalTool { code: Some(2), log, .. }) if log == path
    );
    let ok = ExternalCommand::new("true");
    assert_eq!(run_checked(&SystemCommandRunner::new(), &ok, &log).unwrap(), 0);
}

#[test]
fn slow_tool_is_killed_at_its_timeout() {
    let temp = tempfile::tempdir().unwrap();
    let path = Utf8Path::from_path(temp.path()).unwrap().join("qc.log");
    let log = StageLog::create(&path, "qc").unwrap();

    let command = ExternalCommand::new("sleep")
        .arg("5")
        .timeout(Some(Duration::from_secs(1)));
    assert_matches!(
        SystemCommandRunner::new().run(&command, &log),
        Err(KiraError::ToolTimedOut { seconds: 1, .. })
    );
    assert!(fs::read_to_string(&path).unwrap().contains("killed after 1s"));
}

#[test]
fn unknown_program_is_a_missing_tool() {
    let temp = tempfile::tempdir().unwrap();
    let path = Utf8Path::from_path(temp.path()).unwrap().join("b1.log");
    let log = StageLog::create(&path, "b1").unwrap();

    let command = ExternalCommand::new("kira-no-such-program-xyz");
    assert_matches!(
        SystemCommandRunner::new().run(&command, &log),
        Err(KiraError::MissingTool(name)) if name == "kira-no-such-program-xyz"
    );
}

#[test]
fn display_quotes_arguments_with_spaces() {
    let command = ExternalCommand::new("fslswapdim")
        .args(["in file.nii.gz", "-x", "y", "z"])
        .arg("");
    assert_eq!(
        command.display(),
        "fslswapdim \"in file.nii.gz\" -x y z \"\""
    );
}
