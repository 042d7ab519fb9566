use assert_cmd::Command;
use predicates::prelude::*;

fn write_config(dir: &std::path::Path) {
    let config = r#"
engine:
  base_url: "https://engine.example.com"
  shared_secret: "test-secret"
  user_id: "user-1"
"#;
    std::fs::write(dir.join("config.yaml"), config).expect("write config");
}

#[test]
fn help_lists_subcommands() {
    Command::cargo_bin("pluct")
        .expect("binary")
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("transcribe"))
        .stdout(predicate::str::contains("balance"))
        .stdout(predicate::str::contains("health"));
}

#[test]
fn config_show_prints_engine_settings() {
    let dir = tempfile::tempdir().expect("tempdir");
    write_config(dir.path());

    Command::cargo_bin("pluct")
        .expect("binary")
        .current_dir(dir.path())
        .args(["config", "--show"])
        .assert()
        .success()
        .stdout(predicate::str::contains("https://engine.example.com"))
        .stdout(predicate::str::contains("user-1"));
}

#[test]
fn transcribe_rejects_non_http_urls() {
    let dir = tempfile::tempdir().expect("tempdir");
    write_config(dir.path());

    Command::cargo_bin("pluct")
        .expect("binary")
        .current_dir(dir.path())
        .args(["transcribe", "ftp://example.com/video"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("http(s)"));
}

#[test]
fn transcribe_refuses_unconfigured_secret() {
    let dir = tempfile::tempdir().expect("tempdir");
    std::fs::write(
        dir.path().join("config.yaml"),
        "engine:\n  base_url: \"https://engine.example.com\"\n",
    )
    .expect("write config");

    Command::cargo_bin("pluct")
        .expect("binary")
        .current_dir(dir.path())
        .args(["transcribe", "https://short.video/t/abc"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("shared secret"));
}
