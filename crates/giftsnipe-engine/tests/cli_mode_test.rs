use std::io::Write;
use std::process::Command;

use tempfile::NamedTempFile;

fn write_config(body: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("create temp config");
    file.write_all(body.as_bytes()).expect("write temp config");
    file
}

fn run_engine(config: &NamedTempFile, extra: &[&str]) -> std::process::Output {
    let binary_path = env!("CARGO_BIN_EXE_giftsnipe-engine");
    Command::new(binary_path)
        .arg("--config")
        .arg(config.path())
        .args(extra)
        .env("RUST_LOG", "info")
        .output()
        .expect("Failed to start giftsnipe-engine binary")
}

const VALID: &str = r#"
market: tonnel
strategy:
  price_ceiling: "25"
accounts:
  - id: acc1
    credentials: demo-token
"#;

#[test]
fn dry_run_with_valid_config_exits_zero() {
    let config = write_config(VALID);
    let output = run_engine(&config, &["--dry-run"]);

    assert!(
        output.status.success(),
        "Process exited with non-zero status: {}\nStdout: {}\nStderr: {}",
        output.status,
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(
        stdout.lines().all(|line| line.starts_with("[tonnel] ")),
        "unexpected log prefix:\n{stdout}"
    );
}

#[test]
fn unknown_field_is_a_config_error() {
    let config = write_config(
        r#"
market: portal
strategy:
  price_ceiling: "25"
  surprise: true
accounts:
  - id: acc1
"#,
    );
    let output = run_engine(&config, &["--dry-run"]);
    assert_eq!(output.status.code(), Some(2));

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("[engine] "), "{stdout}");
}

#[test]
fn live_mode_without_client_is_a_config_error() {
    let config = write_config(&format!("mode: live\n{VALID}"));
    let output = run_engine(&config, &[]);
    assert_eq!(output.status.code(), Some(2));
}
