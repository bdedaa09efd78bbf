//! Tests for the CLI surface, driven through the built binary.

use std::process::Command;

/// Verify the binary can print help without error.
#[test]
fn cli_help_works() {
    let output = Command::new(env!("CARGO_BIN_EXE_jailrun"))
        .arg("--help")
        .output()
        .expect("failed to execute jailrun --help");

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(
        stdout.contains("jailrun"),
        "help output should mention jailrun, got: {stdout}"
    );
}

/// Verify `run` refuses to start without its required arguments.
#[test]
fn cli_run_requires_arguments() {
    let output = Command::new(env!("CARGO_BIN_EXE_jailrun"))
        .args(["run", "/prog"])
        .output()
        .expect("failed to execute jailrun run");

    assert!(
        !output.status.success(),
        "run without --jail/--input/--output/--whitelist/--uid/--gid should fail"
    );
}

/// A uid of 0 must be rejected before anything is attempted.
#[test]
fn cli_run_rejects_root_uid() {
    let tmp = tempfile::tempdir().unwrap();
    let input = tmp.path().join("in.txt");
    let whitelist = tmp.path().join("whitelist");
    std::fs::write(&input, "").unwrap();
    std::fs::write(&whitelist, "read\nwrite\nexit_group\n").unwrap();

    let output = Command::new(env!("CARGO_BIN_EXE_jailrun"))
        .args([
            "run",
            "--jail",
            tmp.path().to_str().unwrap(),
            "--input",
            input.to_str().unwrap(),
            "--output",
            tmp.path().join("out.txt").to_str().unwrap(),
            "--whitelist",
            whitelist.to_str().unwrap(),
            "--uid",
            "0",
            "--gid",
            "65534",
            "/prog",
        ])
        .output()
        .expect("failed to execute jailrun run");

    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("uid 0") || stderr.contains("invalid sandbox configuration"),
        "error should explain the refusal, got: {stderr}"
    );
}

/// A zero wall-clock limit must be rejected the same way.
#[test]
fn cli_run_rejects_zero_limits() {
    let tmp = tempfile::tempdir().unwrap();
    let input = tmp.path().join("in.txt");
    let whitelist = tmp.path().join("whitelist");
    std::fs::write(&input, "").unwrap();
    std::fs::write(&whitelist, "read\nwrite\nexit_group\n").unwrap();

    let output = Command::new(env!("CARGO_BIN_EXE_jailrun"))
        .args([
            "run",
            "--jail",
            tmp.path().to_str().unwrap(),
            "--input",
            input.to_str().unwrap(),
            "--output",
            tmp.path().join("out.txt").to_str().unwrap(),
            "--whitelist",
            whitelist.to_str().unwrap(),
            "--uid",
            "65534",
            "--gid",
            "65534",
            "--wall-ms",
            "0",
            "/prog",
        ])
        .output()
        .expect("failed to execute jailrun run");

    assert_eq!(output.status.code(), Some(1));
}
