use crate::sched::floor::Batch;

fn sanitize_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut prev_sep = false;
    for ch in value.chars() {
        if ch.is_whitespace() {
            if !out.is_empty() && !prev_sep {
                out.push('_');
                prev_sep = true;
            }
        } else if !ch.is_control() {
            out.push(ch);
            prev_sep = false;
        }
    }
    let trimmed = out.trim_matches('_');
    if trimmed.is_empty() {
        "na".to_string()
    } else {
        trimmed.to_string()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct WarnEvent<'a> {
    pub code: &'a str,
    pub stage: &'a str,
    pub action: &'a str,
    pub conversation: &'a str,
    /// Batch the warning concerns, rendered as its `#start-end` artifact marker.
    pub range: Option<Batch>,
    pub retry: &'a str,
    pub reason: &'a str,
    pub err: &'a str,
}

pub fn format_event(event: &WarnEvent<'_>) -> String {
    format!(
        "FLOORSUM_WARN code={} stage={} action={} conversation={} range={} retry={} reason={} err={}",
        sanitize_value(event.code),
        sanitize_value(event.stage),
        sanitize_value(event.action),
        sanitize_value(event.conversation),
        event
            .range
            .map_or_else(|| "na".to_string(), |batch| batch.marker()),
        sanitize_value(event.retry),
        sanitize_value(event.reason),
        sanitize_value(event.err),
    )
}

pub fn emit(event: WarnEvent<'_>) {
    eprintln!("{}", format_event(&event));
}
