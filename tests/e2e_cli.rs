use assert_cmd::cargo::cargo_bin_cmd;
use tempfile::TempDir;

#[test]
fn cli_version_shows_binary_name() {
    let output = cargo_bin_cmd!("vmpulse").arg("--version").output().unwrap();
    print_output("e2e_cli", &output);
    assert!(
        output.status.success(),
        "expected success, got status: {}",
        output.status
    );
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(
        stdout.contains("vmpulse"),
        "expected --version output to contain 'vmpulse', got: {}",
        stdout
    );
}

#[test]
fn list_reports_no_sessions_when_empty() {
    let temp = TempDir::new().unwrap();

    let output = cargo_bin_cmd!("vmpulse")
        .env("VMPULSE_HOME", temp.path().join("root"))
        .arg("list")
        .output()
        .unwrap();
    print_output("e2e_cli", &output);
    assert!(
        output.status.success(),
        "expected success, got status: {}",
        output.status
    );
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(
        stdout.contains("No sessions were found."),
        "expected empty sessions message, got: {}",
        stdout
    );
}

#[test]
fn list_shows_session_with_marker() {
    let temp = TempDir::new().unwrap();
    let session = temp.path().join("default");
    std::fs::create_dir_all(&session).unwrap();
    std::fs::write(session.join("ha.pid"), "4242\n").unwrap();

    let output = cargo_bin_cmd!("vmpulse")
        .env("VMPULSE_HOME", temp.path())
        .arg("list")
        .output()
        .unwrap();
    print_output("e2e_cli", &output);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("default"), "got: {}", stdout);
    assert!(stdout.contains("4242"), "got: {}", stdout);
}

#[test]
fn unlock_with_yes_removes_pidfile() {
    let temp = TempDir::new().unwrap();
    let session = temp.path().join("stale");
    std::fs::create_dir_all(&session).unwrap();
    std::fs::write(session.join("ha.pid"), "1\n").unwrap();

    let output = cargo_bin_cmd!("vmpulse")
        .env("VMPULSE_HOME", temp.path())
        .args(["unlock", "stale", "--yes"])
        .output()
        .unwrap();
    print_output("e2e_cli", &output);
    assert!(output.status.success());
    assert!(!session.join("ha.pid").exists());
}

#[test]
fn start_prints_ssh_port_when_ready() {
    let temp = TempDir::new().unwrap();
    let config = temp.path().join("vmpulse.toml");
    std::fs::write(
        &config,
        r#"
[agent]
tick_ms = 3000
iptables_idle_ms = 5000
proc_net_dir = "/proc/net"

[supervisor]
startup_timeout_ms = 5000
watch_timeout_ms = 10000
poll_interval_ms = 20
control_program = "/bin/sh"
control_args = ["-c", "echo $$ > \"$2\"; echo '{\"status\":{\"running\":true,\"sshLocalPort\":60022}}'; sleep 1", "control"]
"#,
    )
    .unwrap();

    let output = cargo_bin_cmd!("vmpulse")
        .env("VMPULSE_HOME", temp.path())
        .arg("-c")
        .arg(&config)
        .args(["start", "default"])
        .output()
        .unwrap();
    print_output("e2e_cli", &output);
    assert!(
        output.status.success(),
        "expected success, got status: {}",
        output.status
    );
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("60022"), "got: {}", stdout);
    assert!(temp.path().join("default").join("cli.log").exists());
}

#[test]
fn start_fails_when_control_process_exits() {
    let temp = TempDir::new().unwrap();
    let config = temp.path().join("vmpulse.toml");
    std::fs::write(
        &config,
        r#"
[agent]
tick_ms = 3000
iptables_idle_ms = 5000
proc_net_dir = "/proc/net"

[supervisor]
startup_timeout_ms = 5000
watch_timeout_ms = 600000
poll_interval_ms = 20
control_program = "/bin/sh"
control_args = ["-c", "echo $$ > \"$2\"; exit 3", "control"]
"#,
    )
    .unwrap();

    let output = cargo_bin_cmd!("vmpulse")
        .env("VMPULSE_HOME", temp.path())
        .arg("-c")
        .arg(&config)
        .args(["start", "default"])
        .output()
        .unwrap();
    print_output("e2e_cli", &output);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("exited unexpectedly"), "got: {}", stderr);
}

fn print_output(prefix: &str, output: &std::process::Output) {
    let stdout = String::from_utf8_lossy(&output.stdout);
    for line in stdout.lines() {
        println!("[{}] {}", prefix, line);
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    for line in stderr.lines() {
        eprintln!("[{}] {}", prefix, line);
    }
}
