use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::extract::DefaultBodyLimit;
use axum::http::HeaderValue;
use clap::Parser;
use tower_http::cors::CorsLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use costgov::config::{Config, StoreKind};
use costgov::engine::policy_store::PolicyStore;
use costgov::engine::{EngineSettings, EscalationEngine};
use costgov::jobs::timeout_sweeper;
use costgov::models::deduction::DeductionStatus;
use costgov::models::policy::ApproverRole;
use costgov::models::workflow::{Decision, DecisionSubmission};
use costgov::notification::Notifier;
use costgov::store::{DeductionFilter, GovernanceStore, MemoryStore, PgStore};
use costgov::{api, config, AppState};

mod cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    use opentelemetry::KeyValue;
    use opentelemetry_sdk::{trace as sdktrace, Resource};

    // OTLP export is opt-in; without an endpoint we only log to stdout.
    let telemetry_layer = if std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").is_ok() {
        match opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(opentelemetry_otlp::new_exporter().tonic())
            .with_trace_config(sdktrace::config().with_resource(Resource::new(vec![
                KeyValue::new("service.name", "costgov"),
            ])))
            .install_batch(opentelemetry_sdk::runtime::Tokio)
        {
            Ok(tracer) => Some(tracing_opentelemetry::layer().with_tracer(tracer)),
            Err(e) => {
                eprintln!("failed to install OpenTelemetry tracer, continuing without it: {}", e);
                None
            }
        }
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "costgov=debug,tower_http=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .with(telemetry_layer)
        .init();

    let cfg = config::load()?;
    let args = cli::Cli::parse();

    let result = match args.command {
        Some(cli::Commands::Serve { port }) => {
            let port = port.unwrap_or(cfg.port);
            run_server(cfg, port).await
        }
        None => {
            let port = cfg.port;
            run_server(cfg, port).await
        }
        Some(cli::Commands::Sweep { batch_size }) => {
            let engine = build_engine(&cfg, false).await?;
            let stats = timeout_sweeper::run_sweep(&engine, batch_size.unwrap_or(cfg.sweep_batch_size)).await?;
            println!(
                "Sweep complete:\n  Found:       {}\n  Timed out:   {}\n  Deductions:  {}\n  Lost race:   {}\n  Failed:      {}",
                stats.found, stats.timed_out, stats.deductions_issued, stats.lost_race, stats.failed
            );
            Ok(())
        }
        Some(cli::Commands::Workflow { command }) => {
            let engine = build_engine(&cfg, false).await?;
            handle_workflow_command(command, &engine).await
        }
        Some(cli::Commands::Deduction { command }) => {
            let engine = build_engine(&cfg, false).await?;
            handle_deduction_command(command, &engine).await
        }
        Some(cli::Commands::Policy { command }) => {
            let engine = build_engine(&cfg, false).await?;
            handle_policy_command(command, &engine).await
        }
    };

    if let Err(ref e) = result {
        tracing::error!("{:#}", e);
    }
    opentelemetry::global::shutdown_tracer_provider();
    result
}

/// Pick the store, load the policy book and wire the notifier.
async fn build_engine(cfg: &Config, migrate: bool) -> anyhow::Result<EscalationEngine> {
    let store: Arc<dyn GovernanceStore> = match cfg.store {
        StoreKind::Postgres => {
            tracing::info!("Connecting to database...");
            let db = PgStore::connect(&cfg.database_url)
                .await
                .context("failed to connect to DATABASE_URL")?;
            if migrate {
                tracing::info!("Running migrations...");
                db.migrate().await?;
            }
            Arc::new(db)
        }
        StoreKind::Memory => {
            tracing::warn!("Using in-memory store; state is lost on exit");
            Arc::new(MemoryStore::new())
        }
    };

    let notifier = Notifier::new(
        cfg.webhook_urls.clone(),
        cfg.webhook_secret.clone(),
        cfg.slack_webhook_url.clone(),
    );
    let settings = EngineSettings {
        escalation_timeout_hours: cfg.escalation_timeout_hours,
        ..EngineSettings::default()
    };
    let engine = EscalationEngine::new(store, PolicyStore::default(), notifier, settings);
    engine
        .reload_policies()
        .await
        .context("failed to load threshold policies")?;
    Ok(engine)
}

async fn run_server(cfg: Config, port: u16) -> anyhow::Result<()> {
    let engine = build_engine(&cfg, true).await?;
    if !engine.policies().is_populated().await {
        tracing::warn!("No threshold policies configured; every evaluation will fail until one is added");
    }

    let sweep_interval = Duration::from_secs(cfg.sweep_interval_secs);
    let sweep_batch = cfg.sweep_batch_size;
    let state = Arc::new(AppState {
        engine: engine.clone(),
        config: cfg,
    });

    let app = api::app(state)
        .layer(DefaultBodyLimit::max(1024 * 1024))
        .layer({
            use axum::http::{HeaderName, Method};
            use tower_http::cors::AllowOrigin;
            let dashboard_origin = std::env::var("DASHBOARD_ORIGIN")
                .unwrap_or_else(|_| "http://localhost:3000".to_string());
            CorsLayer::new()
                .allow_origin(AllowOrigin::predicate(move |origin, _| {
                    let origin_str = origin.to_str().unwrap_or("");
                    origin_str == dashboard_origin
                        || origin_str.starts_with("http://localhost:")
                        || origin_str.starts_with("http://127.0.0.1:")
                }))
                .allow_methods([Method::GET, Method::POST, Method::PUT, Method::OPTIONS])
                .allow_headers([
                    HeaderName::from_static("content-type"),
                    HeaderName::from_static("authorization"),
                    HeaderName::from_static("x-admin-key"),
                    HeaderName::from_static("x-request-id"),
                ])
        })
        .layer(axum::middleware::from_fn(request_id_middleware));

    timeout_sweeper::spawn(engine, sweep_interval, sweep_batch);
    tracing::info!(
        interval_secs = sweep_interval.as_secs(),
        batch_size = sweep_batch,
        "Timeout sweeper started"
    );

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("costgov listening on {}", addr);
    axum::serve(listener, app).await?;
    Ok(())
}

/// Middleware: injects a unique X-Request-Id into every response.
async fn request_id_middleware(
    req: axum::extract::Request,
    next: axum::middleware::Next,
) -> axum::response::Response {
    let req_id = Uuid::new_v4().to_string();
    let mut resp = next.run(req).await;
    if let Ok(val) = HeaderValue::from_str(&req_id) {
        resp.headers_mut().insert("x-request-id", val);
    }
    resp.headers_mut()
        .insert("cache-control", HeaderValue::from_static("no-store"));
    resp
}

async fn handle_workflow_command(
    cmd: cli::WorkflowCommands,
    engine: &EscalationEngine,
) -> anyhow::Result<()> {
    match cmd {
        cli::WorkflowCommands::List { role } => {
            let role = match role {
                Some(r) => Some(
                    ApproverRole::parse(&r)
                        .with_context(|| format!("Invalid role '{}': expected fc, gm or ceo", r))?,
                ),
                None => None,
            };
            let workflows = engine.list_pending_workflows(role).await?;
            if workflows.is_empty() {
                println!("No pending workflows.");
            } else {
                println!(
                    "{:<38} {:<38} {:<12} {:<12} {:<25}",
                    "ID", "VIOLATION", "TYPE", "KIND", "EXPIRES"
                );
                for w in workflows {
                    println!(
                        "{:<38} {:<38} {:<12} {:<12} {:<25}",
                        w.id,
                        w.violation_id,
                        w.workflow_type,
                        format!("{:?}", w.kind),
                        w.expires_at.to_rfc3339()
                    );
                }
            }
        }
        cli::WorkflowCommands::Decide {
            workflow_id,
            approver,
            decision,
            comment,
        } => {
            let workflow_id = Uuid::parse_str(&workflow_id).context("Invalid workflow_id")?;
            let approver_id = Uuid::parse_str(&approver).context("Invalid approver id")?;
            let decision = Decision::parse(&decision)
                .with_context(|| format!("Invalid decision '{}': expected approve or reject", decision))?;

            let outcome = engine
                .decide(DecisionSubmission {
                    workflow_id,
                    approver_id,
                    decision,
                    comment,
                })
                .await?;

            println!(
                "Decision recorded:\n  Workflow:  {}\n  Decision:  {}\n  Status:    {}",
                workflow_id, outcome.decision.decision, outcome.workflow_status
            );
            if outcome.replayed {
                println!("  (identical decision was already on file)");
            }
            if let Some(status) = outcome.violation_status {
                println!("  Violation: {}", status);
            }
            if let Some(id) = outcome.deduction_id {
                println!("  Deduction: {}", id);
            }
        }
    }
    Ok(())
}

async fn handle_deduction_command(
    cmd: cli::DeductionCommands,
    engine: &EscalationEngine,
) -> anyhow::Result<()> {
    match cmd {
        cli::DeductionCommands::List { status } => {
            let status = match status {
                Some(s) => Some(
                    DeductionStatus::parse(&s)
                        .with_context(|| format!("Invalid status '{}'", s))?,
                ),
                None => None,
            };
            let deductions = engine
                .deductions(DeductionFilter {
                    status,
                    ..DeductionFilter::default()
                })
                .await?;
            if deductions.is_empty() {
                println!("No deductions found.");
            } else {
                println!(
                    "{:<38} {:<38} {:>14} {:<18} {:<10} {:<12}",
                    "ID", "USER", "AMOUNT", "TRIGGER", "STATUS", "DATE"
                );
                for d in deductions {
                    println!(
                        "{:<38} {:<38} {:>14} {:<18} {:<10} {:<12}",
                        d.id, d.user_id, d.amount, d.trigger_status, d.status, d.deduction_date
                    );
                }
            }
        }
        cli::DeductionCommands::Processed { deduction_id, actor } => {
            let id = Uuid::parse_str(&deduction_id).context("Invalid deduction_id")?;
            let d = engine.mark_deduction_processed(id, &actor).await?;
            println!("Deduction {} marked {}.", d.id, d.status);
        }
    }
    Ok(())
}

async fn handle_policy_command(
    cmd: cli::PolicyCommands,
    engine: &EscalationEngine,
) -> anyhow::Result<()> {
    match cmd {
        cli::PolicyCommands::List => {
            let policies = engine.list_policies().await;
            if policies.is_empty() {
                println!("No policies found.");
            } else {
                println!(
                    "{:<38} {:<16} {:<16} {:>14} {:>14} {:<8}",
                    "ID", "CATEGORY", "SUBCATEGORY", "LIMIT", "DUAL LIMIT", "CRITICAL"
                );
                for p in policies {
                    println!(
                        "{:<38} {:<16} {:<16} {:>14} {:>14} {:<8}",
                        p.id,
                        p.category,
                        p.subcategory.as_deref().unwrap_or("-"),
                        p.fixed_limit,
                        p.dual_approval_limit
                            .map(|d| d.to_string())
                            .unwrap_or_else(|| "-".into()),
                        p.critical
                    );
                }
            }
        }
    }
    Ok(())
}
