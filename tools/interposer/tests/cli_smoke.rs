use assert_cmd::cargo::cargo_bin_cmd;
use interposer::{Arguments, FnCallable, Interposer, Mode, Target};
use serde_json::{json, Value};
use std::path::Path;

fn recorded_tape(path: &Path) {
    let engine = Interposer::new(path, Mode::Recording);
    engine.open().expect("open");
    let echo = Target::function(FnCallable::new("echo", |args: &Arguments| {
        Ok(json!({ "args": args.args.len() }))
    }));
    let proxy = engine.wrap(echo, "default").expect("wrap");
    proxy.call(&Arguments::new().arg("hi")).expect("call");
    proxy.call(&Arguments::new().arg("hi")).expect("call");
    proxy.call(&Arguments::new().arg("bye")).expect("call");
    engine.close().expect("close");
}

#[test]
fn help_lists_subcommands() {
    let mut cmd = cargo_bin_cmd!("interposer");
    cmd.arg("--help");
    let out = cmd.assert().success();
    let stdout = String::from_utf8(out.get_output().stdout.clone()).expect("utf8");

    assert!(stdout.contains("dump"));
    assert!(stdout.contains("info"));
}

#[test]
fn info_reports_counts() {
    let temp = tempfile::tempdir().expect("tempdir");
    let tape = temp.path().join("tape.db");
    recorded_tape(&tape);

    let mut cmd = cargo_bin_cmd!("interposer");
    cmd.arg("info").arg("--store").arg(&tape);
    let out = cmd.assert().success();
    let stdout = String::from_utf8(out.get_output().stdout.clone()).expect("utf8");
    assert!(stdout.contains("format_version=5 hashes=2 outcomes=3 channels=1 ordered_calls=3"));
}

#[test]
fn dump_writes_json_to_the_output_file() {
    let temp = tempfile::tempdir().expect("tempdir");
    let tape = temp.path().join("tape.db");
    let output = temp.path().join("dump.json");
    let log = temp.path().join("logs").join("cli.jsonl");
    recorded_tape(&tape);

    let mut cmd = cargo_bin_cmd!("interposer");
    cmd.arg("--log-file")
        .arg(&log)
        .arg("dump")
        .arg("--store")
        .arg(&tape)
        .arg("--output")
        .arg(&output);
    cmd.assert().success();

    let dump: Value =
        serde_json::from_str(&std::fs::read_to_string(&output).expect("read")).expect("json");
    assert_eq!(dump["format_version"], 5);
    assert_eq!(dump["channel_order"]["default"].as_array().map(Vec::len), Some(3));
    let log_text = std::fs::read_to_string(&log).expect("log");
    assert!(log_text.contains("cli.dump.written"));
}

#[test]
fn missing_tape_exits_nonzero() {
    let temp = tempfile::tempdir().expect("tempdir");
    let mut cmd = cargo_bin_cmd!("interposer");
    cmd.arg("info").arg("--store").arg(temp.path().join("absent.db"));
    let out = cmd.assert().failure();
    let stderr = String::from_utf8(out.get_output().stderr.clone()).expect("utf8");
    assert!(stderr.contains("recording not found"));
}
