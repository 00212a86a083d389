use std::fs;
use std::path::Path;
use std::process::Command;
use tempfile::tempdir;

const TEMPLATE: &str = r#"
object: volume
query: api/cluster/counter/tables/volume/rows
counters:
  - ^^svm
  - ^^name => volume
  - name: read_ops
    property: rate
  - name: read_latency
    property: average
    denominator: read_ops
"#;

fn write(dir: &Path, name: &str, content: &str) -> String {
    let path = dir.join(name);
    fs::write(&path, content).unwrap();
    path.to_string_lossy().into_owned()
}

fn poller() -> Command {
    Command::new(env!("CARGO_BIN_EXE_harvest-poller"))
}

#[test]
fn test_replay_prints_cooked_polls_and_health() {
    let dir = tempdir().unwrap();
    let template = write(dir.path(), "volume.yaml", TEMPLATE);
    let p1 = write(
        dir.path(),
        "p1.json",
        r#"{"records": [{"svm": "vs1", "name": "v1", "read_ops": 1000, "read_latency": 10000}]}"#,
    );
    let p2 = write(
        dir.path(),
        "p2.json",
        r#"[{"svm": "vs1", "name": "v1", "read_ops": 7000, "read_latency": 70000}]"#,
    );

    let output = poller()
        .args(["--no-config", "--log-level", "off", "-t", template.as_str(), "--poll", p1.as_str(), "--poll", p2.as_str()])
        .output()
        .unwrap();
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(stdout.contains("# poll 1 ("));
    assert!(stdout.contains("volume_read_latency{svm=\"vs1\",volume=\"v1\"} 10\n"));
    assert!(stdout.contains("volume_read_ops{svm=\"vs1\",volume=\"v1\"} 100\n"));
    assert!(stdout.contains("harvest_poll_instances{object=\"volume\",poller=\"local\"} 1"));
    assert!(stdout.contains("# calc_seconds object=volume"));
}

#[test]
fn test_disable_health() {
    let dir = tempdir().unwrap();
    let template = write(dir.path(), "volume.yaml", TEMPLATE);
    let p1 = write(dir.path(), "p1.json", "[]");
    let output = poller()
        .args(["--no-config", "--disable-health", "-t", template.as_str(), "--poll", p1.as_str()])
        .output()
        .unwrap();
    assert!(output.status.success());
    assert!(!String::from_utf8_lossy(&output.stdout).contains("harvest_poll"));
}

#[test]
fn test_check_config_rejects_bad_template() {
    let dir = tempdir().unwrap();
    let template = write(dir.path(), "bad.yaml", "object: volume\nquery: q\ncounters:\n  - \"a b c\"\n");
    let output = poller()
        .args(["--no-config", "--check-config", "-t", template.as_str()])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&output.stderr).contains("Template invalid"));

    let good = write(dir.path(), "good.yaml", TEMPLATE);
    let output = poller()
        .args(["--no-config", "--check-config", "-t", good.as_str()])
        .output()
        .unwrap();
    assert!(output.status.success());
}

#[test]
fn test_missing_template_fails() {
    let output = poller().args(["--no-config", "--log-level", "off"]).output().unwrap();
    assert!(!output.status.success());
}
