use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::tempdir;

fn write_transcript(home: &Path, conversation: &str, floors: usize) {
    let dir = home.join("conversations");
    fs::create_dir_all(&dir).expect("mkdir conversations");
    let body: String = (0..floors)
        .map(|floor| {
            format!(
                "{}\n",
                serde_json::json!({"is_user": floor % 2 == 0, "mes": format!("floor {floor} text")})
            )
        })
        .collect();
    fs::write(dir.join(format!("{conversation}.jsonl")), body).expect("write transcript");
}

fn write_script(path: &Path, body: &str) {
    fs::write(path, format!("#!/usr/bin/env bash\n{body}")).expect("write script");
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = fs::metadata(path).expect("metadata").permissions();
        perms.set_mode(0o755);
        fs::set_permissions(path, perms).expect("chmod");
    }
}

fn floorsum(home: &Path, script: &Path) -> assert_cmd::Command {
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("floorsum");
    cmd.current_dir(home)
        .env("FLOORSUM_HOME", home)
        .env_remove("FLOORSUM_CONFIG_PATH")
        .env("FLOORSUM_INTERVAL", "10")
        .env("FLOORSUM_KEEP_COUNT", "5")
        .env("FLOORSUM_SUMMARIZER_PROVIDER", "command")
        .env("FLOORSUM_SUMMARIZER_COMMAND", script)
        .env("FLOORSUM_SUMMARIZER_TIMEOUT_SECS", "30")
        .env("FLOORSUM_SUMMARIZER_MAX_RETRIES", "1")
        .env("FLOORSUM_SUMMARIZER_BACKOFF_MS", "10");
    cmd
}

fn cursor_value(home: &Path, conversation: &str) -> Option<u64> {
    let raw = fs::read_to_string(
        home.join("state")
            .join("cursors")
            .join(format!("{conversation}.json")),
    )
    .ok()?;
    let record: Value = serde_json::from_str(&raw).expect("cursor json");
    record.get("next_floor").and_then(Value::as_u64)
}

fn bin_path() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_floorsum"))
}

#[test]
fn failing_batch_keeps_earlier_progress_and_retries_next_time() {
    let tmp = tempdir().expect("tempdir");
    write_transcript(tmp.path(), "c1", 50);
    let script = tmp.path().join("summarize.sh");
    let calls = tmp.path().join("calls.log");
    write_script(
        &script,
        &format!(
            "echo \"$FLOORSUM_BATCH_START\" >> \"{}\"\ncat > /dev/null\nif [ \"$FLOORSUM_BATCH_START\" = \"20\" ] && [ ! -f \"{}\" ]; then\n  echo 'upstream exploded' >&2\n  exit 1\nfi\necho \"Recap of floors $FLOORSUM_BATCH_START through $FLOORSUM_BATCH_END for $FLOORSUM_CONVERSATION.\"\n",
            calls.display(),
            tmp.path().join("healed").display()
        ),
    );

    floorsum(tmp.path(), &script)
        .args(["trigger", "c1"])
        .assert()
        .code(2)
        .stdout(predicates::str::contains("completed=2"))
        .stdout(predicates::str::contains("batch [20-29] failed"))
        .stderr(predicates::str::contains("FLOORSUM_WARN code=SUMMARIZE_RETRY"))
        .stderr(predicates::str::contains("FLOORSUM_WARN code=BATCH_FAILED"));
    assert_eq!(cursor_value(tmp.path(), "c1"), Some(20));
    let first_run = fs::read_to_string(&calls).expect("calls");
    assert_eq!(first_run.lines().collect::<Vec<_>>(), vec!["0", "10", "20", "20"]);

    fs::write(tmp.path().join("healed"), "").expect("heal");
    floorsum(tmp.path(), &script)
        .args(["trigger", "c1"])
        .assert()
        .success()
        .stdout(predicates::str::contains("cursor_after=40"));
    let all_calls = fs::read_to_string(&calls).expect("calls");
    assert_eq!(
        all_calls.lines().collect::<Vec<_>>(),
        vec!["0", "10", "20", "20", "20", "30"],
        "completed batches are never summarized again"
    );
}

#[test]
fn error_shaped_output_is_rejected() {
    let tmp = tempdir().expect("tempdir");
    write_transcript(tmp.path(), "c1", 50);
    let script = tmp.path().join("summarize.sh");
    write_script(&script, "cat > /dev/null\necho 'Error: quota exceeded'\n");

    floorsum(tmp.path(), &script)
        .env("FLOORSUM_SUMMARIZER_MAX_RETRIES", "0")
        .args(["trigger", "c1"])
        .assert()
        .code(2)
        .stdout(predicates::str::contains("summarizer response rejected"));
    assert_eq!(cursor_value(tmp.path(), "c1"), None);
}

#[test]
fn abort_from_another_process_stops_after_current_batch() {
    let tmp = tempdir().expect("tempdir");
    write_transcript(tmp.path(), "c1", 50);
    let script = tmp.path().join("summarize.sh");
    write_script(
        &script,
        &format!(
            "cat > /dev/null\n\"{}\" abort \"$FLOORSUM_CONVERSATION\" > \"{}\"\necho \"Recap of floors $FLOORSUM_BATCH_START through $FLOORSUM_BATCH_END.\"\n",
            bin_path().display(),
            tmp.path().join("abort.out").display()
        ),
    );

    floorsum(tmp.path(), &script)
        .args(["--json", "trigger", "c1"])
        .assert()
        .success()
        .stdout(predicates::str::contains("\"kind\": \"cancelled\""));
    assert_eq!(cursor_value(tmp.path(), "c1"), Some(10));
    let abort_out = fs::read_to_string(tmp.path().join("abort.out")).expect("abort output");
    assert!(abort_out.contains("abort requested for pid"));
    assert!(
        !tmp.path().join("logs").join("runs").join("c1.abort").exists(),
        "marker is cleared when the run ends"
    );

    floorsum(tmp.path(), &script)
        .args(["abort", "c1"])
        .assert()
        .success()
        .stdout(predicates::str::contains("no run in flight"));
}
