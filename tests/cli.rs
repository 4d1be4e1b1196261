mod common;

use common::codesmith_bin;

#[test]
fn version_prints_and_exits_zero() {
    codesmith_bin()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicates::str::contains("codesmith"));
}

#[test]
fn help_mentions_interactive_mode() {
    codesmith_bin()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicates::str::contains("interactive session"));
}

#[test]
fn one_shot_tool_request_succeeds_without_models() {
    // Without the llama feature the router falls back to its pattern
    // tier, so read-only tool requests work end to end.
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("codesmith.toml"),
        format!(
            "workspace_dir = \"{}\"\n",
            dir.path().join("ws").display()
        ),
    )
    .unwrap();

    codesmith_bin()
        .current_dir(dir.path())
        .arg("pwd")
        .assert()
        .success();
}
