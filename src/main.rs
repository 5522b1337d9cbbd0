use anyhow::Result;
use clap::{Args, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "ars", version, about = "Auto Reply Service")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run a polling cycle for all active tenants, or one tenant
    Run(RunArgs),
    /// Drain due queue items and send their replies
    Worker(WorkerArgs),
    /// Serve trigger requests as JSON lines over stdio
    Serve,
    /// Handle one trigger request and print the JSON response
    Trigger {
        /// Request body; empty processes all active tenants
        #[arg(default_value = "")]
        body: String,
    },
    /// Manage tenant mailboxes
    Tenants {
        #[command(subcommand)]
        command: TenantCommands,
    },
    /// Manage tenant knowledge documents
    Knowledge {
        #[command(subcommand)]
        command: KnowledgeCommands,
    },
    /// Manage tenant prompts
    Prompt {
        #[command(subcommand)]
        command: PromptCommands,
    },
    /// Show tenants, rate-limit usage and queue depth
    Status {
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Show processed messages for a tenant
    Records(RecordsArgs),
}

#[derive(Debug, Args)]
struct RunArgs {
    #[arg(long)]
    tenant: Option<String>,
    #[arg(long, default_value_t = false)]
    watch: bool,
    /// Seconds between cycles in watch mode
    #[arg(long, default_value_t = 300)]
    interval: u64,
    #[arg(long, default_value_t = false)]
    json: bool,
}

#[derive(Debug, Args)]
struct WorkerArgs {
    #[arg(long, default_value_t = false)]
    watch: bool,
    /// Maximum items claimed per drain
    #[arg(long, default_value_t = 25)]
    max: usize,
    /// Seconds between drains in watch mode
    #[arg(long, default_value_t = 30)]
    interval: u64,
    #[arg(long, default_value_t = false)]
    json: bool,
}

#[derive(Debug, Args)]
struct RecordsArgs {
    tenant: String,
    #[arg(long, default_value_t = 50)]
    limit: usize,
    #[arg(long, default_value_t = false)]
    json: bool,
}

#[derive(Debug, Subcommand)]
enum TenantCommands {
    /// List configured tenants
    List {
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Add or update a tenant mailbox
    Add {
        tenant_id: String,
        mailbox: String,
        #[arg(long)]
        display_name: Option<String>,
        #[arg(long, env = "ARS_REFRESH_TOKEN", hide_env_values = true)]
        refresh_token: Option<String>,
    },
    /// Remove a tenant and everything recorded for it
    Remove { tenant_id: String },
    /// Re-activate a tenant after re-consent
    Activate {
        tenant_id: String,
        /// Deactivate instead
        #[arg(long, default_value_t = false)]
        off: bool,
    },
}

#[derive(Debug, Subcommand)]
enum KnowledgeCommands {
    /// Import files matching a glob pattern as knowledge documents
    Import { tenant_id: String, pattern: String },
}

#[derive(Debug, Subcommand)]
enum PromptCommands {
    /// Set a tenant's custom prompt from a file
    Set { tenant_id: String, path: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    commands::dispatch(cli).await
}

mod commands {
    use std::time::Duration;

    use anyhow::{anyhow, Context, Result};
    use serde_json::Value;
    use tracing::{error, info};

    use ars::ai::model::GeminiClient;
    use ars::ai::ModelClient;
    use ars::config::Settings;
    use ars::credentials::TokenSeal;
    use ars::db::models::Tenant;
    use ars::db::Database;
    use ars::guard::RateLimiter;
    use ars::knowledge;
    use ars::output::{self, OutputFormat, StatusView, TenantStatus};
    use ars::pipeline::Pipeline;
    use ars::provider::graph::GraphMailProvider;
    use ars::queue::{signal_for, Queue};
    use ars::sender::ReplySender;
    use ars::trigger;

    use super::{Cli, Commands, KnowledgeCommands, PromptCommands, TenantCommands};

    pub async fn dispatch(cli: Cli) -> Result<()> {
        let settings = Settings::from_env();
        match cli.command {
            Commands::Run(args) => handle_run(&settings, args).await,
            Commands::Worker(args) => handle_worker(&settings, args).await,
            Commands::Serve => handle_serve(&settings).await,
            Commands::Trigger { body } => handle_trigger(&settings, &body).await,
            Commands::Tenants { command } => handle_tenants(&settings, command),
            Commands::Knowledge { command } => handle_knowledge(&settings, command),
            Commands::Prompt { command } => handle_prompt(&settings, command),
            Commands::Status { json } => handle_status(&settings, json),
            Commands::Records(args) => handle_records(&settings, args),
        }
    }

    fn open_db(settings: &Settings) -> Result<Database> {
        let db_path = match &settings.db_path {
            Some(path) => path.clone(),
            None => Database::default_db_path().context("resolve default ARS database path")?,
        };
        Database::open(&db_path)
            .with_context(|| format!("open ARS database at {}", db_path.display()))
    }

    fn load_seal(settings: &Settings) -> Result<Option<TokenSeal>> {
        settings
            .token_key_hex
            .as_deref()
            .map(|raw| TokenSeal::from_hex(raw).context("ARS_TOKEN_KEY must be 64 hex characters"))
            .transpose()
    }

    /// Everything a pipeline borrows, owned in one place for the command's lifetime.
    struct Runtime {
        db: Database,
        provider: GraphMailProvider,
        model: Option<GeminiClient>,
        seal: Option<TokenSeal>,
        signal: Box<dyn ars::queue::WorkerSignal>,
    }

    impl Runtime {
        fn build(settings: &Settings) -> Result<Self> {
            let model = GeminiClient::from_settings(&settings.model);
            if model.is_none() {
                info!("no model API key configured; analysis uses the keyword fallback");
            }
            Ok(Self {
                db: open_db(settings)?,
                provider: GraphMailProvider::new(&settings.provider)
                    .with_page_size(settings.fetch.page_size),
                model,
                seal: load_seal(settings)?,
                signal: signal_for(settings.worker_url.as_deref()),
            })
        }

        fn pipeline<'a>(&'a self, settings: &'a Settings) -> Pipeline<'a> {
            Pipeline::new(&self.db, &self.provider, settings)
                .with_model(self.model.as_ref().map(|model| model as &dyn ModelClient))
                .with_seal(self.seal.as_ref())
                .with_signal(self.signal.as_ref())
        }
    }

    async fn handle_run(settings: &Settings, args: super::RunArgs) -> Result<()> {
        let runtime = Runtime::build(settings)?;
        let pipeline = runtime.pipeline(settings);
        let format = OutputFormat::from_json_flag(args.json);

        loop {
            match args.tenant.as_deref() {
                Some(tenant_id) => {
                    let report = pipeline
                        .process_tenant(tenant_id)
                        .await
                        .with_context(|| format!("process tenant {tenant_id}"))?;
                    let cycle = ars::pipeline::CycleReport {
                        started_at: ars::db::timestamp(pipeline.now()),
                        tenants: vec![report],
                    };
                    println!("{}", output::format_cycle_report(format, &cycle)?);
                }
                None => match pipeline.process_all().await {
                    Ok(report) => println!("{}", output::format_cycle_report(format, &report)?),
                    Err(err) if args.watch => error!(error = %err, "cycle failed"),
                    Err(err) => return Err(err).context("process all tenants"),
                },
            }

            if !args.watch {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_secs(args.interval.max(1))).await;
        }
    }

    async fn handle_worker(settings: &Settings, args: super::WorkerArgs) -> Result<()> {
        let runtime = Runtime::build(settings)?;
        let pipeline = runtime.pipeline(settings);
        let sender = ReplySender::new(&pipeline);
        let format = OutputFormat::from_json_flag(args.json);

        loop {
            match sender.drain(args.max, pipeline.now()).await {
                Ok(report) => {
                    if !args.watch || report.claimed > 0 {
                        println!("{}", output::format_drain_report(format, &report)?);
                    }
                }
                Err(err) if args.watch => error!(error = %err, "queue drain failed"),
                Err(err) => return Err(err).context("drain reply queue"),
            }

            if !args.watch {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_secs(args.interval.max(1))).await;
        }
    }

    async fn handle_serve(settings: &Settings) -> Result<()> {
        let runtime = Runtime::build(settings)?;
        let pipeline = runtime.pipeline(settings);
        trigger::run_stdio_server(&pipeline).await
    }

    async fn handle_trigger(settings: &Settings, body: &str) -> Result<()> {
        let runtime = Runtime::build(settings)?;
        let pipeline = runtime.pipeline(settings);
        let body = body.trim();
        let request = if body.is_empty() {
            None
        } else {
            Some(serde_json::from_str::<Value>(body).context("trigger body must be JSON")?)
        };
        let response = trigger::handle_request(&pipeline, request).await;
        println!("{}", serde_json::to_string_pretty(&response)?);
        Ok(())
    }

    fn handle_tenants(settings: &Settings, command: TenantCommands) -> Result<()> {
        let db = open_db(settings)?;

        match command {
            TenantCommands::List { json } => {
                let tenants = db.list_tenants()?;
                let formatted =
                    output::format_tenants(OutputFormat::from_json_flag(json), &tenants)?;
                println!("{formatted}");
            }
            TenantCommands::Add {
                tenant_id,
                mailbox,
                display_name,
                refresh_token,
            } => {
                let mut tenant = match db.get_tenant(&tenant_id)? {
                    Some(existing) => existing,
                    None => Tenant::new(&tenant_id, ""),
                };
                tenant.mailbox_address = mailbox.trim().to_ascii_lowercase();
                if display_name.is_some() {
                    tenant.display_name = display_name;
                }
                if let Some(token) = refresh_token {
                    tenant.refresh_token = Some(match load_seal(settings)? {
                        Some(seal) => seal.seal(&token).context("seal refresh token")?,
                        None => token,
                    });
                }
                tenant.active = true;
                db.upsert_tenant(&tenant)?;
                println!("Saved tenant: {} <{}>", tenant.tenant_id, tenant.mailbox_address);
            }
            TenantCommands::Remove { tenant_id } => {
                if db.remove_tenant(&tenant_id)? == 0 {
                    println!("No tenant found: {tenant_id}");
                } else {
                    println!("Removed tenant: {tenant_id}");
                }
            }
            TenantCommands::Activate { tenant_id, off } => {
                if db.set_tenant_active(&tenant_id, !off)? == 0 {
                    return Err(anyhow!("tenant not found: {tenant_id}"));
                }
                println!(
                    "Tenant {tenant_id} {}",
                    if off { "deactivated" } else { "activated" }
                );
            }
        }
        Ok(())
    }

    fn handle_knowledge(settings: &Settings, command: KnowledgeCommands) -> Result<()> {
        let db = open_db(settings)?;
        match command {
            KnowledgeCommands::Import { tenant_id, pattern } => {
                let report = knowledge::import_glob(&db, &tenant_id, &pattern)
                    .with_context(|| format!("import knowledge for tenant {tenant_id}"))?;
                println!("Knowledge import complete");
                println!("Files matched: {}", report.files_matched);
                println!("Documents imported: {}", report.documents_imported);
                if report.errors.is_empty() {
                    println!("Errors: 0");
                } else {
                    println!("Errors: {}", report.errors.len());
                    for error in report.errors {
                        println!("- {error}");
                    }
                }
            }
        }
        Ok(())
    }

    fn handle_prompt(settings: &Settings, command: PromptCommands) -> Result<()> {
        let db = open_db(settings)?;
        match command {
            PromptCommands::Set { tenant_id, path } => {
                if db.get_tenant(&tenant_id)?.is_none() {
                    return Err(anyhow!("tenant not found: {tenant_id}"));
                }
                let prompt = std::fs::read_to_string(&path)
                    .with_context(|| format!("read prompt file {path}"))?;
                let prompt = prompt.trim();
                if prompt.is_empty() {
                    return Err(anyhow!("prompt file {path} is empty"));
                }
                db.set_custom_prompt(&tenant_id, prompt)?;
                println!("Custom prompt set for {tenant_id} ({} chars)", prompt.chars().count());
            }
        }
        Ok(())
    }

    fn handle_status(settings: &Settings, json: bool) -> Result<()> {
        let db = open_db(settings)?;
        let now = chrono::Utc::now();
        let limiter = RateLimiter::new(&db);
        let queue = Queue::new(&db);

        let mut tenants = Vec::new();
        for tenant in db.list_tenants()? {
            let limits = settings.rate_limits.for_tenant(&tenant);
            tenants.push(TenantStatus {
                rate_limits: limiter.snapshot(&tenant.tenant_id, &limits, now)?,
                queue: queue.stats(&tenant.tenant_id)?,
                tenant,
            });
        }
        let status = StatusView {
            database: db.get_stats()?,
            tenants,
        };
        println!(
            "{}",
            output::format_status(OutputFormat::from_json_flag(json), &status)?
        );
        Ok(())
    }

    fn handle_records(settings: &Settings, args: super::RecordsArgs) -> Result<()> {
        let db = open_db(settings)?;
        if db.get_tenant(&args.tenant)?.is_none() {
            return Err(anyhow!("tenant not found: {}", args.tenant));
        }
        let records = db.list_processed(&args.tenant, args.limit)?;
        println!(
            "{}",
            output::format_records(OutputFormat::from_json_flag(args.json), &records)?
        );
        Ok(())
    }
}
