use anyhow::Result;

use crate::commands::CommandReport;
use crate::sched::config::{api_key_from_env, load_config, resolve_config_path};
use crate::sched::paths::resolve_paths;

#[derive(Debug, Clone)]
pub struct ConfigOptions {
    pub show: bool,
}

pub fn run(opts: &ConfigOptions) -> Result<CommandReport> {
    let paths = resolve_paths()?;
    let mut report = CommandReport::new("config");
    let cfg = load_config(&paths.home)?;

    if opts.show {
        report.detail(
            "resolution.order=defaults -> floorsum.toml overrides -> environment overrides",
        );
        let config_path = resolve_config_path(&paths.home);
        if config_path.exists() {
            report.detail(format!("resolution.floorsum_toml={}", config_path.display()));
        } else {
            report.detail(format!(
                "resolution.floorsum_toml=missing ({})",
                config_path.display()
            ));
        }
        report.detail(format!("schedule.interval={}", cfg.schedule.interval));
        report.detail(format!("schedule.keep_count={}", cfg.schedule.keep_count));
        report.detail(format!(
            "schedule.max_batches_per_run={}",
            cfg.schedule.max_batches_per_run
        ));
        report.detail(format!("sync.enabled={}", cfg.sync.enabled));
        report.detail(format!("sync.auto_bind={}", cfg.sync.auto_bind));
        report.detail(format!("summarizer.provider={}", cfg.summarizer.provider));
        if !cfg.summarizer.model.is_empty() {
            report.detail(format!("summarizer.model={}", cfg.summarizer.model));
        }
        if !cfg.summarizer.base_url.is_empty() {
            report.detail(format!("summarizer.base_url={}", cfg.summarizer.base_url));
        }
        if !cfg.summarizer.command.is_empty() {
            report.detail(format!("summarizer.command={}", cfg.summarizer.command));
        }
        report.detail(format!(
            "summarizer.timeout_secs={}",
            cfg.summarizer.timeout_secs
        ));
        report.detail(format!(
            "summarizer.max_retries={}",
            cfg.summarizer.max_retries
        ));
        report.detail(format!(
            "summarizer.retry_backoff_ms={}",
            cfg.summarizer.retry_backoff_ms
        ));
        if let Some(kind) = cfg.summarizer.provider_kind()
            && kind.is_remote()
        {
            let key = if api_key_from_env(kind).is_some() {
                "set"
            } else {
                "missing"
            };
            report.detail(format!("summarizer.api_key={key}"));
        }
    } else {
        report.detail("config valid");
    }

    Ok(report)
}
