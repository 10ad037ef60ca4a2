//! CLI integration tests for the `jasper` binary.

use assert_cmd::Command;
use predicates::prelude::*;

#[test]
fn evaluates_inline_source() {
    Command::cargo_bin("jasper")
        .unwrap()
        .args(["-e", "print 40 + 2"])
        .assert()
        .success()
        .stdout("42\n");
}

#[test]
fn runs_a_script_file() {
    let dir = tempfile::tempdir().unwrap();
    let script = dir.path().join("main.jsr");
    std::fs::write(&script, "print \"from file\"\n").unwrap();
    Command::cargo_bin("jasper")
        .unwrap()
        .arg(&script)
        .assert()
        .success()
        .stdout("from file\n");
}

#[test]
fn script_imports_resolve_next_to_the_script() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("dep.jsr"), "var value = 3\n").unwrap();
    let script = dir.path().join("main.jsr");
    std::fs::write(&script, "import dep\nprint dep.value\n").unwrap();
    Command::cargo_bin("jasper")
        .unwrap()
        .arg(&script)
        .assert()
        .success()
        .stdout("3\n");
}

#[test]
fn script_arguments_reach_sys_args() {
    let dir = tempfile::tempdir().unwrap();
    let script = dir.path().join("args.jsr");
    std::fs::write(&script, "import sys\nprint #sys.args\nprint sys.args[1]\n").unwrap();
    Command::cargo_bin("jasper")
        .unwrap()
        .arg(&script)
        .args(["alpha", "beta"])
        .assert()
        .success()
        .stdout("2\nbeta\n");
}

#[test]
fn syntax_errors_exit_with_data_error() {
    Command::cargo_bin("jasper")
        .unwrap()
        .args(["-e", "var = 1"])
        .assert()
        .code(65)
        .stderr(predicate::str::contains("line:1"));
}

#[test]
fn unhandled_exceptions_exit_with_software_error() {
    Command::cargo_bin("jasper")
        .unwrap()
        .args(["-e", "raise Exception(\"bye\")"])
        .assert()
        .code(70)
        .stderr(predicate::str::contains("Exception: bye"));
}

#[test]
fn missing_script_is_a_usage_error() {
    Command::cargo_bin("jasper").unwrap().assert().code(64);
}

#[test]
fn missing_file_is_reported() {
    Command::cargo_bin("jasper")
        .unwrap()
        .arg("definitely-not-here.jsr")
        .assert()
        .code(66)
        .stderr(predicate::str::contains("cannot read"));
}
