use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;

#[test]
fn test_cli_generate_then_stats() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let data = dir.path().join("toy");

    let mut cmd = Command::cargo_bin("convrec")?;
    cmd.arg("generate").arg("--out").arg(&data).arg("--conversations").arg("20");
    cmd.assert()
        .success()
        .stdout(predicate::str::contains("16 train / 2 valid / 2 test"));

    let mut cmd = Command::cargo_bin("convrec")?;
    cmd.arg("stats").arg("--data").arg(&data);
    cmd.assert()
        .success()
        .stdout(predicate::str::contains("Train records:  16"))
        .stdout(predicate::str::contains("Items:          12"));

    let mut cmd = Command::cargo_bin("convrec")?;
    cmd.arg("stats").arg("--data").arg(&data).arg("--json");
    let out = cmd.assert().success().get_output().stdout.clone();
    let stats: serde_json::Value = serde_json::from_slice(&out)?;
    assert_eq!(stats["valid"], 2);
    Ok(())
}

#[test]
fn test_cli_stats_missing_dir_fails() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let mut cmd = Command::cargo_bin("convrec")?;
    cmd.arg("stats").arg("--data").arg(dir.path().join("nope"));
    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("Failed to load dataset"));
    Ok(())
}

#[test]
fn test_cli_check_config() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let good = dir.path().join("good.json");
    fs::write(&good, r#"{"rec": {"epoch": 4}, "device": "cpu"}"#)?;
    let mut cmd = Command::cargo_bin("convrec")?;
    cmd.arg("check-config").arg(&good);
    cmd.assert()
        .success()
        .stdout(predicate::str::contains("\"impatience\": 3"));

    let bad = dir.path().join("bad.json");
    fs::write(&bad, r#"{"rec": {"batch_size": 0}}"#)?;
    let mut cmd = Command::cargo_bin("convrec")?;
    cmd.arg("check-config").arg(&bad);
    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("batch_size must be positive"));
    Ok(())
}

#[test]
fn test_cli_train_rejects_unknown_stage() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let mut cmd = Command::cargo_bin("convrec")?;
    cmd.arg("train")
        .arg("--data")
        .arg(dir.path())
        .arg("--stage")
        .arg("finetune");
    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("invalid stage"));
    Ok(())
}

#[test]
fn test_cli_demo_runs_all_stages() -> Result<(), Box<dyn std::error::Error>> {
    let mut cmd = Command::cargo_bin("convrec")?;
    cmd.arg("demo").arg("--epochs").arg("1").arg("--conversations").arg("10");
    cmd.assert()
        .success()
        .stdout(predicate::str::contains("pretrain: 1 epochs"))
        .stdout(predicate::str::contains("rec: 1 epochs"))
        .stdout(predicate::str::contains("conv: 1 epochs"))
        .stdout(predicate::str::contains("policy: [test]"));
    Ok(())
}
