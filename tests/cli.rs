use std::fs;
use std::process::Command;

use tempfile::tempdir;

#[test]
fn config_subcommand_prints_loadable_toml() {
    let exe = env!("CARGO_BIN_EXE_resilience");
    let output = Command::new(exe)
        .arg("config")
        .output()
        .expect("run resilience cli");
    assert!(output.status.success(), "CLI exited with {:?}", output.status);

    let text = String::from_utf8(output.stdout).expect("utf-8 output");
    assert!(text.contains("[paths]"));
    assert!(text.contains("n_imputations = 5"));

    let tmp = tempdir().expect("temporary directory");
    let path = tmp.path().join("pipeline.toml");
    fs::write(&path, &text).expect("write config");
    let reread = Command::new(exe)
        .args(["--config", path.to_str().expect("path str"), "config"])
        .output()
        .expect("run resilience cli");
    assert!(reread.status.success());
    assert_eq!(String::from_utf8_lossy(&reread.stdout), text);
}

#[test]
fn missing_inputs_fail_with_a_message() {
    let tmp = tempdir().expect("temporary directory");
    let path = tmp.path().join("pipeline.toml");
    fs::write(&path, "[paths]\nsav = \"does/not/exist.sav\"\n").expect("write config");

    let output = Command::new(env!("CARGO_BIN_EXE_resilience"))
        .current_dir(tmp.path())
        .args(["--config", path.to_str().expect("path str"), "extract"])
        .output()
        .expect("run resilience cli");
    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Error:"), "stderr was: {stderr}");
    assert!(stderr.contains("does/not/exist.sav"));
}

#[test]
fn invalid_configuration_is_rejected() {
    let tmp = tempdir().expect("temporary directory");
    let path = tmp.path().join("pipeline.toml");
    fs::write(&path, "[forest]\ntest_fraction = 1.5\n").expect("write config");

    let output = Command::new(env!("CARGO_BIN_EXE_resilience"))
        .args(["--config", path.to_str().expect("path str"), "config"])
        .output()
        .expect("run resilience cli");
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("test_fraction"));
}
