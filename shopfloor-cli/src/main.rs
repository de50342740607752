//! Shopfloor command-line interface.
//!
//! Triggers sync runs, the scheduler loop, dispatch recomputation,
//! consistency checks and work-order rollback against the configured local
//! server.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::process;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use shopfloor::admin::DatabaseAdmin;
use shopfloor::connection::connect;
use shopfloor::mes::schema::ensure_mes_tables;
use shopfloor::mes::{
    ArchiveService, ConsistencyService, FindingKind, FixMethod, MesStore, OrderIdentity, PgMesStore, ReportPatch,
    RollbackService, StatisticsEngine,
};
use shopfloor::sync::{PgReplicaConnector, SyncExecutor, SyncMode, SyncRequest, TenantScheduler};
use shopfloor::tenant::{ensure_tenant_tables, UpstreamCredential};
use shopfloor::{EngineConfig, PgExecutor, PgTenantStore, Tenant, TenantStore};

#[derive(Parser)]
#[command(name = "shopfloor")]
#[command(about = "ERP sync and work-order reconciliation")]
#[command(version = "0.1.0")]
struct Cli {
    /// Configuration file
    #[arg(long, default_value = "config/config.toml")]
    config: String,

    /// Name recorded in the operation log
    #[arg(long, default_value = "cli")]
    actor: String,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Quiet output (errors only)
    #[arg(short, long)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the registry and shop-floor tables
    Init,

    /// Store the upstream ERP server login
    Credential {
        /// `host` or `host,port`
        #[arg(long)]
        host: String,
        #[arg(long)]
        user: String,
        #[arg(long, env = "SHOPFLOOR_UPSTREAM_PASSWORD")]
        password: String,
    },

    /// Register a tenant and create its replica database
    Provision {
        #[arg(long)]
        code: String,
        #[arg(long)]
        name: String,
        #[arg(long)]
        upstream_database: String,
        #[arg(long)]
        local_database: String,
        /// Comma-separated table list
        #[arg(long, default_value = "")]
        tables: String,
        /// Minutes between scheduled runs; 0 disables them
        #[arg(long, default_value = "0")]
        interval: u32,
    },

    /// Drop a tenant's replica database and unregister it
    Decommission {
        #[arg(long)]
        code: String,
    },

    /// List tenants and their watermarks
    Tenants,

    /// Run one sync
    Sync {
        #[arg(long)]
        tenant: String,
        /// `full` or `incremental`
        #[arg(long, default_value = "incremental")]
        mode: String,
        /// Comma-separated subset of the tenant's tables
        #[arg(long)]
        tables: Option<String>,
    },

    /// Run the scheduler loop
    Schedule {
        /// Stop after this many seconds instead of running until killed
        #[arg(long)]
        for_secs: Option<u64>,
    },

    /// Recompute dispatch statistics
    Recompute {
        /// Dispatch id; every in-production dispatch when omitted
        #[arg(long)]
        dispatch: Option<i64>,
    },

    /// Run consistency checks
    Check {
        /// Finding kind; all kinds when omitted
        #[arg(long)]
        kind: Option<String>,
    },

    /// Correct open findings of one kind
    Correct {
        #[arg(long)]
        kind: String,
        /// Plan corrections without writing them
        #[arg(long)]
        dry_run: bool,
    },

    /// Settle a finding by hand
    Resolve {
        #[arg(long)]
        finding: i64,
        /// `delete_report`, `update_report` or `mark_only`
        #[arg(long)]
        method: String,
        #[arg(long)]
        company_name: Option<String>,
        #[arg(long)]
        company_code: Option<String>,
        #[arg(long)]
        order_number: Option<String>,
        #[arg(long)]
        product_code: Option<String>,
    },

    /// Move completed work orders into the completed archive
    Archive {
        #[arg(long, requires_all = ["order", "product"])]
        company: Option<String>,
        #[arg(long)]
        order: Option<String>,
        #[arg(long)]
        product: Option<String>,
    },

    /// Reopen a completed work order
    Rollback {
        #[arg(long)]
        completed: i64,
        /// Put the work order's reports back to pending
        #[arg(long)]
        reset_approval: bool,
        /// Only report whether the rollback is allowed
        #[arg(long)]
        check: bool,
    },

    /// Show the latest operation log entries
    Log {
        #[arg(long, default_value = "20")]
        limit: usize,
    },

    /// Print Prometheus metrics gathered during this process
    Metrics,
}

fn main() {
    let cli = Cli::parse();

    let level = if cli.quiet {
        "error"
    } else if cli.verbose {
        "debug"
    } else {
        "info"
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    match run(cli) {
        Ok(()) => process::exit(0),
        Err(e) => {
            eprintln!("❌ Error: {e:#}");
            process::exit(1);
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let config = EngineConfig::load_from(&cli.config).context("loading configuration")?;
    let actor = cli.actor.as_str();

    match cli.command {
        Commands::Init => {
            let registry = registry_executor(&config)?;
            ensure_tenant_tables(&registry)?;
            ensure_mes_tables(&registry)?;
            println!("✅ Registry tables ready in {}", config.local.registry_database);
        }
        Commands::Credential { host, user, password } => {
            tenant_store(&config)?.save_upstream_credential(&UpstreamCredential { host, user, password })?;
            println!("✅ Upstream credential saved");
        }
        Commands::Provision {
            code,
            name,
            upstream_database,
            local_database,
            tables,
            interval,
        } => {
            let tenant = Tenant {
                company_code: code,
                company_name: name,
                upstream_database,
                local_database,
                sync_tables: Tenant::parse_table_list(&tables),
                last_sync_version: None,
                last_sync_time: None,
                sync_interval_minutes: interval,
            };
            let store = tenant_store(&config)?;
            let created = DatabaseAdmin::new(config.local.clone()).provision_tenant(&store, &tenant, actor)?;
            println!(
                "✅ Tenant {} registered, database {} {}",
                tenant.company_code,
                tenant.local_database,
                if created { "created" } else { "already existed" }
            );
        }
        Commands::Decommission { code } => {
            let store = tenant_store(&config)?;
            DatabaseAdmin::new(config.local.clone()).decommission_tenant(&store, &code, actor)?;
            println!("✅ Tenant {code} removed");
        }
        Commands::Tenants => {
            for t in tenant_store(&config)?.list_tenants()? {
                println!(
                    "{:<8} {:<24} tables={} interval={}m version={} last={}",
                    t.company_code,
                    t.company_name,
                    t.sync_tables.len(),
                    t.sync_interval_minutes,
                    t.last_sync_version.map_or("-".to_string(), |v| v.to_string()),
                    t.last_sync_time.map_or("-".to_string(), |at| at.to_string()),
                );
            }
        }
        Commands::Sync { tenant, mode, tables } => {
            let mode: SyncMode = mode.parse().map_err(anyhow::Error::msg)?;
            let mut request = SyncRequest::new(tenant, mode, actor);
            if let Some(tables) = tables {
                request = request.with_tables(Tenant::parse_table_list(&tables));
            }
            let scheduler = TenantScheduler::new(Arc::new(sync_executor(&config)?), config.sync.scheduler_tick());
            let report = scheduler.try_run(&request)?;
            println!("{}", report.summary());
            for table in &report.tables {
                match &table.error {
                    Some(reason) => println!("  ❌ {}: {reason}", table.table),
                    None => println!(
                        "  ✓ {}: {} rows, {} skipped{}",
                        table.table,
                        table.rows_succeeded,
                        table.rows_failed,
                        if table.degraded {
                            ", rebuilt without key"
                        } else if table.history_expired {
                            ", rebuilt after upstream purged its changes"
                        } else {
                            ""
                        }
                    ),
                }
                for failure in &table.row_failures {
                    println!("      {} {}: {}", failure.kind, failure.row, failure.reason);
                }
            }
            if !report.refused_tables.is_empty() {
                println!("  refused: {}", report.refused_tables.join(", "));
            }
        }
        Commands::Schedule { for_secs } => {
            let scheduler = Arc::new(TenantScheduler::new(
                Arc::new(sync_executor(&config)?),
                config.sync.scheduler_tick(),
            ));
            let handle = scheduler.start()?;
            match for_secs {
                Some(secs) => {
                    thread::sleep(Duration::from_secs(secs));
                    handle.shutdown();
                }
                None => loop {
                    thread::park();
                },
            }
        }
        Commands::Recompute { dispatch } => {
            let engine = StatisticsEngine::new(mes_store(&config), &config.statistics);
            match dispatch {
                Some(id) => {
                    let done = engine.recompute(id)?;
                    println!(
                        "✅ Dispatch {id} ({}): packaging {} ({:.1}%), status {}",
                        done.identity,
                        done.stats.packaging_total_quantity,
                        done.stats.packaging_completion_rate,
                        done.dispatch_status
                    );
                }
                None => {
                    let summary = engine.recompute_all_in_production()?;
                    println!("✅ {} dispatches updated, {} failed", summary.updated, summary.errors);
                }
            }
        }
        Commands::Check { kind } => {
            let service = ConsistencyService::new(mes_store(&config), config.consistency.clone());
            let results = match kind {
                Some(kind) => {
                    let kind = parse_kind(&kind)?;
                    vec![(kind, service.run_check(kind)?)]
                }
                None => service.run_all_checks()?,
            };
            for (kind, summary) in results {
                println!(
                    "{:<16} checked {:>6}  findings {:>5}  ambiguous {:>4}",
                    kind.as_str(),
                    summary.checked, summary.findings, summary.ambiguous
                );
            }
        }
        Commands::Correct { kind, dry_run } => {
            let store = mes_store(&config);
            let service = ConsistencyService::new(Arc::clone(&store), config.consistency.clone())
                .with_statistics(StatisticsEngine::new(store, &config.statistics));
            let report = service.correct(parse_kind(&kind)?, dry_run, actor)?;
            println!("{}", report.summary());
            for c in &report.corrections {
                println!("  report {} {}: {} -> {} ({})", c.report_id, c.field, c.old_value, c.new_value, c.reason);
            }
            for a in &report.ambiguous {
                println!("  report {} skipped, {} candidate work orders", a.report_id, a.candidates.len());
            }
            for e in &report.errors {
                println!("  ❌ report {}: {}", e.report_id, e.reason);
            }
        }
        Commands::Resolve {
            finding,
            method,
            company_name,
            company_code,
            order_number,
            product_code,
        } => {
            let method = match method.as_str() {
                "delete_report" => FixMethod::DeleteReport,
                "mark_only" => FixMethod::MarkOnly,
                "update_report" => FixMethod::UpdateReport(ReportPatch {
                    company_name,
                    company_code,
                    order_number,
                    product_code,
                }),
                other => bail!("unknown fix method '{other}'"),
            };
            let store = mes_store(&config);
            let service = ConsistencyService::new(Arc::clone(&store), config.consistency.clone())
                .with_statistics(StatisticsEngine::new(store, &config.statistics));
            let resolved = service.resolve_finding(finding, &method, actor)?;
            println!("✅ Finding {} ({}) resolved with {}", resolved.id, resolved.kind, method.as_str());
        }
        Commands::Archive { company, order, product } => {
            let service = ArchiveService::new(mes_store(&config));
            match (company, order, product) {
                (Some(company), Some(order), Some(product)) => {
                    let archived = service.archive(&OrderIdentity::new(company, order, product), actor)?;
                    println!("✅ Work order {} archived as completed record {}", archived.identity, archived.id);
                }
                _ => {
                    let summary = service.archive_all_completed(actor)?;
                    println!("✅ {} work orders archived, {} failed", summary.updated, summary.errors);
                }
            }
        }
        Commands::Rollback {
            completed,
            reset_approval,
            check,
        } => {
            let store = mes_store(&config);
            let service =
                RollbackService::new(Arc::clone(&store)).with_statistics(StatisticsEngine::new(store, &config.statistics));
            if check {
                let verdict = service.can_rollback(completed)?;
                println!("{} {}", if verdict.allowed { "✅" } else { "❌" }, verdict.reason);
            } else {
                let outcome = service.rollback(completed, !reset_approval, actor)?;
                println!(
                    "✅ Work order {} reopened: {} processes rebuilt, {} reopened, {} reports reset",
                    outcome.work_order_id, outcome.processes_created, outcome.processes_reopened, outcome.reports_reset
                );
            }
        }
        Commands::Log { limit } => {
            for entry in tenant_store(&config)?.operation_log(limit)? {
                println!("{}  {:<12} {}", entry.at.format("%Y-%m-%d %H:%M:%S"), entry.actor, entry.action);
            }
        }
        Commands::Metrics => print!("{}", shopfloor::metrics::METRICS.render()),
    }
    Ok(())
}

fn parse_kind(raw: &str) -> Result<FindingKind> {
    FindingKind::parse(raw).with_context(|| {
        let known: Vec<&str> = FindingKind::ALL.iter().map(|k| k.as_str()).collect();
        format!("unknown finding kind '{raw}', expected one of {}", known.join(", "))
    })
}

fn registry_executor(config: &EngineConfig) -> Result<PgExecutor> {
    let url = config.local.connection_string(&config.local.registry_database)?;
    let client = connect(&url).with_context(|| format!("connecting to {}", config.local.registry_database))?;
    Ok(PgExecutor::new(client))
}

fn tenant_store(config: &EngineConfig) -> Result<PgTenantStore> {
    Ok(PgTenantStore::new(registry_executor(config)?))
}

fn mes_store(config: &EngineConfig) -> Arc<dyn MesStore> {
    Arc::new(PgMesStore::new(config.local.clone()))
}

fn sync_executor(config: &EngineConfig) -> Result<SyncExecutor> {
    Ok(SyncExecutor::from_config(
        &config.sync,
        Arc::new(tenant_store(config)?),
        Arc::new(shopfloor::sync::MssqlConnector::new(config.upstream.clone())),
        Arc::new(PgReplicaConnector::new(config.local.clone())),
    ))
}
