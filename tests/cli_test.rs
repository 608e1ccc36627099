use assert_cmd::Command;
use predicates::prelude::*;

#[test]
fn test_check_sscc_accepts_valid_code() {
    let mut cmd = Command::cargo_bin("packline").unwrap();

    cmd.args(["check-sscc", "376104250021234569"])
        .assert()
        .success()
        .stdout(predicate::str::contains("376104250021234569 is a valid SSCC"));
}

#[test]
fn test_check_sscc_rejects_bad_check_digit() {
    let mut cmd = Command::cargo_bin("packline").unwrap();

    cmd.args(["check-sscc", "376104250021234560"]).assert().failure();
}

#[test]
fn test_decode_prints_unit_fields() {
    let mut cmd = Command::cargo_bin("packline").unwrap();

    cmd.args(["decode", "0104600417010234215ABCDEF93zz99"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"gtin\": \"04600417010234\""))
        .stdout(predicate::str::contains("\"serial_number\": \"ABCDEF\""));
}

#[test]
fn test_decode_falls_back_to_case_code() {
    let mut cmd = Command::cargo_bin("packline").unwrap();

    cmd.args(["decode", "]C100376104250021234569"])
        .assert()
        .success()
        .stdout(predicate::str::contains("376104250021234569"));
}

#[test]
fn test_help_lists_subcommands() {
    let mut cmd = Command::cargo_bin("packline").unwrap();

    cmd.arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("run"))
        .stdout(predicate::str::contains("check-sscc"))
        .stdout(predicate::str::contains("status"));
}
