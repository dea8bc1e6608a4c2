//! Integration tests for the `bestrun` binary.

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

const NLI_RUNS: &str = "\
fn_prefix,Run ID,Name,attention,lr,best_valid_acc,SM_ASET_maxit,SM_eta,SM_maxit,SM_thr,batch_size,dataset,normalize_embed,update_embed
models/reimp_sm_,r1,n1,sparsemap,0.001,0.80,10,1.0,20,1e-6,32,snli,True,False
models/reimp_sm_,r2,n2,sparsemap,0.002,0.84,10,1.0,20,1e-6,32,snli,True,False
models/reimp_sx_,r3,n3,softmax,0.001,0.83,10,1.0,20,1e-6,32,snli,True,False
models/other_sx_,r4,n4,softmax,0.001,0.99,10,1.0,20,1e-6,32,snli,True,False
";

fn bestrun() -> Command {
    Command::cargo_bin("bestrun").unwrap()
}

fn workspace() -> TempDir {
    let temp = TempDir::new().unwrap();
    fs::create_dir(temp.path().join("models")).unwrap();
    fs::write(temp.path().join("runs.csv"), NLI_RUNS).unwrap();
    temp
}

fn touch(root: &Path, rel: &str) {
    fs::write(root.join(rel), b"weights").unwrap();
}

#[test]
fn select_writes_summary_and_prints_report() {
    let temp = workspace();
    bestrun()
        .current_dir(temp.path())
        .args(["select", "runs.csv"])
        .assert()
        .success()
        .stdout(predicate::str::contains("attention = sparsemap"))
        .stdout(predicate::str::contains("summary:"));

    let summary = fs::read_to_string(temp.path().join("best-runs.csv")).unwrap();
    assert_eq!(summary.lines().count(), 3, "{}", summary);
    assert!(summary.contains("r2"));
    assert!(summary.contains("r3"));
    assert!(!summary.contains("r4"), "tag filter should drop r4: {}", summary);
}

#[test]
fn select_json_lists_winner_rows() {
    let temp = workspace();
    let assert = bestrun()
        .current_dir(temp.path())
        .args(["select", "runs.csv", "--json"])
        .assert()
        .success();
    let stdout = String::from_utf8_lossy(&assert.get_output().stdout).to_string();
    let json: serde_json::Value = serde_json::from_str(&stdout).expect("select --json should print JSON");
    assert_eq!(json["ok"], true);
    assert_eq!(json["winners"], serde_json::json!([1, 2]));
    assert_eq!(json["group_column"], "attention");
}

#[test]
fn no_tag_keeps_untagged_runs() {
    let temp = workspace();
    bestrun()
        .current_dir(temp.path())
        .args(["select", "runs.csv", "--no-tag"])
        .assert()
        .success();
    let summary = fs::read_to_string(temp.path().join("best-runs.csv")).unwrap();
    assert!(summary.contains("r4"), "{}", summary);
}

#[test]
fn stage_copies_checkpoints_and_writes_script() {
    let temp = workspace();
    touch(temp.path(), "models/reimp_sm_r2_00100.pt");
    touch(temp.path(), "models/reimp_sm_r2_00200.pt");
    touch(temp.path(), "models/reimp_sx_r3_00050.pt");
    let out = format!("{}/", temp.path().join("out").display());

    bestrun()
        .current_dir(temp.path())
        .args(["stage", "runs.csv", &out, "--search-root", "."])
        .assert()
        .success()
        .stdout(predicate::str::contains("staged: sparsemap"))
        .stdout(predicate::str::contains("script: run_test_nli.sh"));

    assert!(temp.path().join("out").join("reimp_sm_r2_00200.pt").exists());
    assert!(temp.path().join("out").join("reimp_sx_r3_00050.pt").exists());
    let script = fs::read_to_string(temp.path().join("run_test_nli.sh")).unwrap();
    assert_eq!(script.matches("build/esim --test").count(), 2, "{}", script);
    assert!(script.contains("--attn sparsemap"));
    assert!(script.contains("--sparsemap-residual-thr 1e-6"));
}

#[test]
fn stage_json_reports_skipped_rows() {
    let temp = workspace();
    touch(temp.path(), "models/reimp_sm_r2_00200.pt");
    let script = temp.path().join("custom.sh");

    let assert = bestrun()
        .current_dir(temp.path())
        .args(["stage", "runs.csv", "out/", "--search-root", ".", "--json"])
        .arg("--script")
        .arg(&script)
        .assert()
        .success();
    let stdout = String::from_utf8_lossy(&assert.get_output().stdout).to_string();
    let json: serde_json::Value = serde_json::from_str(&stdout).expect("stage --json should print JSON");
    assert_eq!(json["staged"].as_array().map(|a| a.len()), Some(1));
    assert_eq!(json["skipped"][0]["run_id"], "r3");
    assert_eq!(json["skipped"][0]["reason"], "no_artifact");
    assert!(script.exists());
}

#[test]
fn missing_metric_column_fails_with_error_code_in_json_mode() {
    let temp = workspace();
    bestrun()
        .current_dir(temp.path())
        .args(["select", "runs.csv", "--metric", "best_valid_f1", "--json"])
        .assert()
        .failure()
        .code(1)
        .stdout(predicate::str::contains("\"ok\":false"))
        .stdout(predicate::str::contains("dataset_load"))
        .stdout(predicate::str::contains("best_valid_f1"));
    assert!(!temp.path().join("best-runs.csv").exists());
}

#[test]
fn missing_input_fails_without_json() {
    let temp = TempDir::new().unwrap();
    bestrun()
        .current_dir(temp.path())
        .args(["select", "nope.csv"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("nope.csv"));
}

#[test]
fn config_file_overrides_preset() {
    let temp = workspace();
    fs::write(
        temp.path().join("over.yaml"),
        "export_columns: [\"Run ID\", attention]\nprefix_tag: other\n",
    )
    .unwrap();
    bestrun()
        .current_dir(temp.path())
        .args(["select", "runs.csv", "--config", "over.yaml"])
        .assert()
        .success();
    let summary = fs::read_to_string(temp.path().join("best-runs.csv")).unwrap();
    assert_eq!(summary, "Run ID,attention\nr4,softmax\n");
}

#[test]
fn unknown_config_key_is_rejected() {
    let temp = workspace();
    fs::write(temp.path().join("bad.yaml"), "metric: acc\n").unwrap();
    bestrun()
        .current_dir(temp.path())
        .args(["select", "runs.csv", "--config", "bad.yaml", "--json"])
        .assert()
        .failure()
        .stdout(predicate::str::contains("invalid_config"));
}

#[test]
fn count_params_reads_stdin() {
    bestrun()
        .arg("count-params")
        .write_stdin("# embed {100,300}\n# bias {300}\nloss 1.2\n# w {2,3,4}\n")
        .assert()
        .success()
        .stdout("30324\n");
}

#[test]
fn count_params_sums_files() {
    let temp = TempDir::new().unwrap();
    fs::write(temp.path().join("a.txt"), "# a {10,10}\n").unwrap();
    fs::write(temp.path().join("b.txt"), "# b {5}\n").unwrap();
    bestrun()
        .current_dir(temp.path())
        .args(["count-params", "a.txt", "b.txt"])
        .assert()
        .success()
        .stdout("105\n");
}

#[test]
fn presets_lists_both_presets() {
    bestrun()
        .arg("presets")
        .assert()
        .success()
        .stdout(predicate::str::contains("# preset: nli"))
        .stdout(predicate::str::contains("# preset: tagger"))
        .stdout(predicate::str::contains("run_test_tag.sh"));
}
