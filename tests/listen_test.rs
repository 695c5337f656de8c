use serde_json::Value;
use std::fs;
use std::path::Path;
use tempfile::tempdir;

fn write_transcript(home: &Path, conversation: &str, floors: usize) {
    let dir = home.join("conversations");
    fs::create_dir_all(&dir).expect("mkdir conversations");
    let body: String = (0..floors)
        .map(|floor| format!("{{\"is_user\":true,\"mes\":\"note {floor}\"}}\n"))
        .collect();
    fs::write(dir.join(format!("{conversation}.jsonl")), body).expect("write transcript");
}

#[test]
fn serves_events_from_stdin_until_eof() {
    let tmp = tempdir().expect("tempdir");
    write_transcript(tmp.path(), "c1", 50);
    write_transcript(tmp.path(), "c2", 8);

    let events = [
        r#"{"event":"grew","conversation":"c1"}"#,
        r#"{"event":"grew","conversation":"c2"}"#,
        r#"{"event":"poll","conversation":"c1"}"#,
        "",
    ]
    .join("\n");

    let output = assert_cmd::cargo::cargo_bin_cmd!("floorsum")
        .current_dir(tmp.path())
        .env("FLOORSUM_HOME", tmp.path())
        .env_remove("FLOORSUM_CONFIG_PATH")
        .env_remove("FLOORSUM_SUMMARIZER_PROVIDER")
        .env("FLOORSUM_INTERVAL", "10")
        .env("FLOORSUM_KEEP_COUNT", "5")
        .arg("listen")
        .write_stdin(events)
        .assert()
        .success()
        .stderr(predicates::str::contains("LISTEN_BAD_EVENT"))
        .get_output()
        .stdout
        .clone();
    let stdout = String::from_utf8(output).expect("utf8");

    let outcomes: Vec<Value> = stdout
        .lines()
        .filter(|line| line.starts_with('{'))
        .map(|line| serde_json::from_str::<Value>(line).expect("event json"))
        .filter(|event| event["type"] == "outcome")
        .collect();
    assert_eq!(outcomes.len(), 2);
    let c1 = outcomes
        .iter()
        .find(|event| event["conversation"] == "c1")
        .expect("c1 outcome");
    assert_eq!(c1["result"]["outcome"], "ran");
    assert_eq!(c1["result"]["cursor_after"], 40);
    let c2 = outcomes
        .iter()
        .find(|event| event["conversation"] == "c2")
        .expect("c2 outcome");
    assert_eq!(c2["result"]["outcome"], "waiting");
    assert_eq!(c2["result"]["next_floor"], 0, "c2 never adopts c1's progress");

    let bindings: Value = serde_json::from_str(
        &fs::read_to_string(tmp.path().join("artifacts").join("bindings.json"))
            .expect("bindings"),
    )
    .expect("bindings json");
    assert_eq!(bindings["c1"], "c1-summary");
    assert!(bindings.get("c2").is_none());

    assert!(stdout.contains("events_accepted=2"));
    assert!(stdout.contains("events_rejected=1"));
}
