use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::json;
use std::io::{self, BufRead};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::commands::{CommandReport, install_interrupt_handler, load_context};
use crate::sched::engine::{Engine, TriggerKind};
use crate::sched::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    #[serde(alias = "log_grew")]
    Grew,
    #[serde(alias = "catch-up")]
    CatchUp,
    Abort,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InboundEvent {
    pub event: EventKind,
    pub conversation: String,
}

pub fn parse_event(line: &str) -> Result<InboundEvent> {
    let event: InboundEvent =
        serde_json::from_str(line).with_context(|| format!("invalid event line `{line}`"))?;
    if event.conversation.trim().is_empty() {
        anyhow::bail!("event without conversation id");
    }
    Ok(event)
}

fn spawn_run(engine: &Arc<Engine>, event: InboundEvent) -> JoinHandle<()> {
    let engine = Arc::clone(engine);
    thread::spawn(move || {
        let kind = match event.event {
            EventKind::CatchUp => TriggerKind::ManualCatchUp,
            _ => TriggerKind::LogGrew,
        };
        let conversation = event.conversation;
        let outcome = engine.trigger(&conversation, kind, &mut |progress| {
            println!(
                "{}",
                json!({
                    "type": "progress",
                    "conversation": conversation,
                    "batch": progress.batch,
                    "step": progress.index + 1,
                    "total": progress.total,
                    "next_floor": progress.next_floor,
                })
            );
        });
        println!(
            "{}",
            json!({
                "type": "outcome",
                "conversation": conversation,
                "trigger": kind.as_str(),
                "ok": outcome.is_ok(),
                "result": outcome,
            })
        );
    })
}

/// Serve trigger events from stdin until EOF. Each accepted run gets its own
/// thread, so different conversations proceed independently while a second
/// trigger for a busy conversation is answered with `busy`.
pub fn run() -> Result<CommandReport> {
    let (paths, cfg) = load_context()?;
    let engine = Arc::new(Engine::from_config(paths, &cfg)?);
    install_interrupt_handler(&engine);
    let mut report = CommandReport::new("listen");

    let mut handles = Vec::new();
    let mut accepted = 0usize;
    let mut rejected = 0usize;
    for line in io::stdin().lock().lines() {
        let line = line.context("failed to read stdin")?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let event = match parse_event(trimmed) {
            Ok(event) => event,
            Err(err) => {
                rejected += 1;
                let detail = format!("{err:#}");
                warn::emit(warn::WarnEvent {
                    code: "LISTEN_BAD_EVENT",
                    stage: "listen",
                    action: "skip-line",
                    conversation: "",
                    range: None,
                    retry: "none",
                    reason: "parse-failed",
                    err: &detail,
                });
                continue;
            }
        };
        accepted += 1;
        match event.event {
            EventKind::Abort => {
                let aborted = engine.registry().abort(&event.conversation);
                println!(
                    "{}",
                    json!({
                        "type": "abort",
                        "conversation": event.conversation,
                        "aborted": aborted,
                    })
                );
            }
            EventKind::Grew | EventKind::CatchUp => handles.push(spawn_run(&engine, event)),
        }
        handles.retain(|handle: &JoinHandle<()>| !handle.is_finished());
    }

    for handle in handles {
        if handle.join().is_err() {
            report.issue("a scheduling thread panicked");
        }
    }
    report.detail(format!("events_accepted={accepted}"));
    report.detail(format!("events_rejected={rejected}"));
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::{EventKind, parse_event};

    #[test]
    fn parses_supported_events() {
        let grew = parse_event(r#"{"event":"grew","conversation":"c1"}"#).expect("grew");
        assert_eq!(grew.event, EventKind::Grew);
        let catch_up =
            parse_event(r#"{"event":"catch_up","conversation":"c1"}"#).expect("catch up");
        assert_eq!(catch_up.event, EventKind::CatchUp);
        let abort = parse_event(r#"{"event":"abort","conversation":"c2"}"#).expect("abort");
        assert_eq!(abort.event, EventKind::Abort);
        assert_eq!(abort.conversation, "c2");
    }

    #[test]
    fn rejects_unknown_or_incomplete_events() {
        assert!(parse_event(r#"{"event":"poll","conversation":"c1"}"#).is_err());
        assert!(parse_event(r#"{"event":"grew"}"#).is_err());
        assert!(parse_event(r#"{"event":"grew","conversation":"  "}"#).is_err());
        assert!(parse_event("not json").is_err());
    }
}
