use dbi_core::config::{AppConfig, LoadOptions, ProviderKind};
use dbi_db::{connect_with_config, migrations};
use serde::Serialize;

use crate::commands::block_on;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
enum CheckStatus {
    Pass,
    Fail,
    Skipped,
}

#[derive(Debug, Serialize)]
struct DoctorCheck {
    name: &'static str,
    status: CheckStatus,
    details: String,
}

impl DoctorCheck {
    fn pass(name: &'static str, details: impl Into<String>) -> Self {
        Self { name, status: CheckStatus::Pass, details: details.into() }
    }

    fn fail(name: &'static str, details: impl Into<String>) -> Self {
        Self { name, status: CheckStatus::Fail, details: details.into() }
    }

    fn skipped(name: &'static str) -> Self {
        Self { name, status: CheckStatus::Skipped, details: "skipped because configuration did not load".to_string() }
    }
}

#[derive(Debug, Serialize)]
struct DoctorReport {
    overall_status: CheckStatus,
    summary: String,
    checks: Vec<DoctorCheck>,
}

const CHECKS_AFTER_CONFIG: [&str; 3] = ["provider_credentials", "sandbox_script", "database_schema"];

pub fn run(json_output: bool) -> String {
    let report = build_report();

    if json_output {
        return serde_json::to_string_pretty(&report).unwrap_or_else(|error| {
            serde_json::json!({
                "overall_status": "fail",
                "summary": "doctor serialization failed",
                "error": error.to_string(),
            })
            .to_string()
        });
    }

    render_human(&report)
}

fn build_report() -> DoctorReport {
    let checks = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => vec![
            DoctorCheck::pass("config_validation", "configuration loaded and validated"),
            check_provider_credentials(&config),
            check_sandbox_script(&config),
            check_database_schema(&config),
        ],
        Err(error) => {
            let mut checks = vec![DoctorCheck::fail("config_validation", error.to_string())];
            checks.extend(CHECKS_AFTER_CONFIG.into_iter().map(DoctorCheck::skipped));
            checks
        }
    };

    let all_pass = checks.iter().all(|check| check.status == CheckStatus::Pass);
    let (overall_status, summary) = if all_pass {
        (CheckStatus::Pass, "doctor: all readiness checks passed")
    } else {
        (CheckStatus::Fail, "doctor: one or more readiness checks failed")
    };

    DoctorReport { overall_status, summary: summary.to_string(), checks }
}

/// Every provider bound to a generation mode needs an api key.
fn check_provider_credentials(config: &AppConfig) -> DoctorCheck {
    let llm = &config.llm;
    let mut bound = vec![llm.text_provider, llm.vision_provider, llm.embedding_provider];
    bound.sort_by_key(|kind| kind.as_str());
    bound.dedup();

    let missing: Vec<ProviderKind> =
        bound.iter().copied().filter(|kind| !llm.endpoint(*kind).has_credentials()).collect();
    if missing.is_empty() {
        let names: Vec<&str> = bound.iter().map(ProviderKind::as_str).collect();
        return DoctorCheck::pass("provider_credentials", format!("credentials present for {}", names.join(", ")));
    }

    let names: Vec<&str> = missing.iter().map(ProviderKind::as_str).collect();
    DoctorCheck::fail("provider_credentials", format!("bound providers without an api_key: {}", names.join(", ")))
}

fn check_sandbox_script(config: &AppConfig) -> DoctorCheck {
    let script = &config.sandbox.script;
    if script.is_file() {
        DoctorCheck::pass("sandbox_script", format!("`{}` found", script.display()))
    } else {
        DoctorCheck::fail("sandbox_script", format!("bulk analysis script `{}` does not exist", script.display()))
    }
}

fn check_database_schema(config: &AppConfig) -> DoctorCheck {
    let result = block_on(async {
        let pool = connect_with_config(&config.database)
            .await
            .map_err(|error| format!("failed to connect to database: {error}"))?;
        let migrated = migrations::run_pending(&pool).await.map_err(|error| format!("migrations failed: {error}"));
        pool.close().await;
        migrated
    });

    match result {
        Ok(Ok(())) => DoctorCheck::pass(
            "database_schema",
            format!("connected using `{}` with {} migration(s)", config.database.url, migrations::embedded_count()),
        ),
        Ok(Err(error)) | Err(error) => DoctorCheck::fail("database_schema", error),
    }
}

fn render_human(report: &DoctorReport) -> String {
    let mut lines = vec![report.summary.clone()];

    for check in &report.checks {
        let marker = match check.status {
            CheckStatus::Pass => "ok",
            CheckStatus::Fail => "fail",
            CheckStatus::Skipped => "skip",
        };
        lines.push(format!("- [{marker}] {}: {}", check.name, check.details));
    }

    lines.join("\n")
}
