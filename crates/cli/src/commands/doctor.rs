use noteflow_core::config::{AppConfig, LoadOptions};
use noteflow_core::domain::operation::OperationType;
use noteflow_db::{connect_with_config, migrations::MIGRATOR};
use serde::Serialize;

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
        Self {
            name,
            status: CheckStatus::Skipped,
            details: "skipped because configuration did not load".to_string(),
        }
    }
}

#[derive(Debug, Serialize)]
struct DoctorReport {
    overall_status: CheckStatus,
    summary: String,
    checks: Vec<DoctorCheck>,
}

pub fn run(json_output: bool) -> String {
    let report = build_report();

    if json_output {
        return serde_json::to_string_pretty(&report).unwrap_or_else(|error| {
            format!(
                "{{\"overall_status\":\"fail\",\"summary\":\"doctor serialization failed\",\"error\":\"{}\"}}",
                error.to_string().replace('\\', "\\\\").replace('"', "\\\"")
            )
        });
    }

    render_human(&report)
}

fn build_report() -> DoctorReport {
    let checks = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => vec![
            DoctorCheck::pass("config_validation", "configuration loaded and validated"),
            check_provider_catalog(&config),
            check_database(&config),
        ],
        Err(error) => vec![
            DoctorCheck::fail("config_validation", error.to_string()),
            DoctorCheck::skipped("provider_catalog"),
            DoctorCheck::skipped("database_schema"),
        ],
    };

    let all_pass = checks.iter().all(|check| check.status == CheckStatus::Pass);
    DoctorReport {
        overall_status: if all_pass { CheckStatus::Pass } else { CheckStatus::Fail },
        summary: if all_pass {
            "doctor: all readiness checks passed".to_string()
        } else {
            "doctor: one or more readiness checks failed".to_string()
        },
        checks,
    }
}

/// Every operation must resolve to an active model and template.
fn check_provider_catalog(config: &AppConfig) -> DoctorCheck {
    let registry = match config.catalog.build_registry(&config.llm) {
        Ok(registry) => registry,
        Err(error) => return DoctorCheck::fail("provider_catalog", error.to_string()),
    };
    let templates = match config.catalog.build_templates() {
        Ok(templates) => templates,
        Err(error) => return DoctorCheck::fail("provider_catalog", error.to_string()),
    };

    let mut gaps = Vec::new();
    for operation in OperationType::ALL {
        if let Err(error) = registry.active_model(operation) {
            gaps.push(error.to_string());
        }
        if templates.active_template(operation).is_none() {
            gaps.push(format!("no active template for `{}`", operation.as_str()));
        }
    }

    if gaps.is_empty() {
        DoctorCheck::pass(
            "provider_catalog",
            format!(
                "{} operations covered by {} model(s) at {}",
                OperationType::ALL.len(),
                registry.models().len(),
                config.llm.resolved_base_url(),
            ),
        )
    } else {
        DoctorCheck::fail("provider_catalog", gaps.join("; "))
    }
}

fn check_database(config: &AppConfig) -> DoctorCheck {
    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(error) => {
            return DoctorCheck::fail(
                "database_schema",
                format!("failed to initialize async runtime: {error}"),
            );
        }
    };

    let result = runtime.block_on(async {
        let pool = connect_with_config(&config.database)
            .await
            .map_err(|error| format!("failed to connect to database: {error}"))?;

        let applied: Vec<i64> = sqlx::query_scalar("SELECT version FROM _sqlx_migrations")
            .fetch_all(&pool)
            .await
            .unwrap_or_default();
        pool.close().await;

        let pending: Vec<i64> = MIGRATOR
            .iter()
            .filter(|migration| migration.migration_type.is_up_migration())
            .map(|migration| migration.version)
            .filter(|version| !applied.contains(version))
            .collect();
        Ok::<usize, String>(pending.len())
    });

    match result {
        Ok(0) => DoctorCheck::pass(
            "database_schema",
            format!("connected using `{}`, schema up to date", config.database.url),
        ),
        Ok(pending) => DoctorCheck::fail(
            "database_schema",
            format!("{pending} pending migration(s); run `noteflow migrate`"),
        ),
        Err(error) => DoctorCheck::fail("database_schema", error),
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
