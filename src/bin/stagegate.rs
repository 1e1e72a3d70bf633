//! stagegate CLI: run the promotion controller, manage promotions.

use clap::{Parser, Subcommand};
use secrecy::ExposeSecret;
use stagegate::config::Config;
use stagegate::db::Db;
use stagegate::executor::{StageRegistry, StepExecutor};
use stagegate::model::{NewPromotion, Phase, PromotionKey};
use stagegate::scheduler::{Controller, ControllerConfig};
use stagegate::store::PromotionStore;
use stagegate::telemetry::{TelemetryConfig, init_telemetry};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "stagegate", about = "Admission scheduler for GitOps promotions")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the promotion controller
    Serve {
        /// Directory containing stage TOML configs
        #[arg(long, default_value = "stages")]
        stages: PathBuf,
        /// Maximum concurrent reconciliations (overrides STAGEGATE_MAX_RECONCILES)
        #[arg(long)]
        max_concurrent: Option<usize>,
    },
    /// Promotion operations
    Promotion {
        #[command(subcommand)]
        action: PromotionAction,
    },
}

#[derive(Subcommand)]
enum PromotionAction {
    /// Request a promotion
    Create {
        namespace: String,
        stage: String,
        /// Freight reference to promote
        freight: String,
        /// Promotion name (default: <stage>.<random>)
        #[arg(long)]
        name: Option<String>,
    },
    /// List promotions
    List {
        /// Filter by phase
        #[arg(long)]
        phase: Option<String>,
        /// Filter by stage
        #[arg(long)]
        stage: Option<String>,
        /// Maximum promotions to show
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
    /// Show a promotion
    Show {
        /// <namespace>/<name>
        key: String,
    },
    /// Abort a pending promotion
    Abort {
        /// <namespace>/<name>
        key: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env()?;

    match cli.command {
        Command::Serve {
            stages,
            max_concurrent,
        } => cmd_serve(config, stages, max_concurrent).await,
        Command::Promotion { action } => {
            let db = Db::connect(config.database_url.expose_secret()).await?;
            db.migrate().await?;

            match action {
                PromotionAction::Create {
                    namespace,
                    stage,
                    freight,
                    name,
                } => cmd_create(&db, namespace, stage, freight, name).await,
                PromotionAction::List {
                    phase,
                    stage,
                    limit,
                } => cmd_list(&db, phase, stage, limit).await,
                PromotionAction::Show { key } => cmd_show(&db, &key).await,
                PromotionAction::Abort { key } => cmd_abort(&db, &key).await,
            }
        }
    }
}

async fn cmd_serve(
    config: Config,
    stages: PathBuf,
    max_concurrent: Option<usize>,
) -> anyhow::Result<()> {
    let _guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "stagegate".to_string(),
        log_level: config.log_level.clone(),
    })?;

    let db = Db::connect(config.database_url.expose_secret()).await?;
    db.migrate().await?;

    let registry = StageRegistry::load_from_dir(&stages)?;
    tracing::info!(stages = registry.len(), "stage configs loaded");

    let controller = Arc::new(Controller::new(
        Arc::new(db),
        Arc::new(StepExecutor::new(Arc::new(registry))),
        ControllerConfig {
            resync_interval: config.resync_interval,
            max_concurrent_reconciles: max_concurrent.unwrap_or(config.max_concurrent_reconciles),
            ..ControllerConfig::default()
        },
    ));

    let ctrl = Arc::clone(&controller);
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        ctrl.shutdown();
    });

    controller.run().await?;
    Ok(())
}

async fn cmd_create(
    db: &Db,
    namespace: String,
    stage: String,
    freight: String,
    name: Option<String>,
) -> anyhow::Result<()> {
    let mut new = NewPromotion::new(namespace, stage, freight);
    if let Some(name) = name {
        new = new.name(name);
    }
    let promotion = db.create(new).await?;
    println!("Created: {} (phase: {})", promotion.key(), promotion.phase);
    Ok(())
}

async fn cmd_list(
    db: &Db,
    phase: Option<String>,
    stage: Option<String>,
    limit: i64,
) -> anyhow::Result<()> {
    let phase: Option<Phase> = phase.map(|p| p.parse()).transpose()?;
    let items = db.list_promotions(phase, stage.as_deref(), limit).await?;

    if items.is_empty() {
        println!("No promotions found.");
        return Ok(());
    }

    println!(
        "{:<16}  {:<32}  {:<12}  {:<10}  {:<20}  CREATED",
        "NAMESPACE", "NAME", "STAGE", "PHASE", "FREIGHT"
    );
    println!("{}", "-".repeat(110));

    for item in &items {
        let freight: String = item.freight.chars().take(20).collect();
        println!(
            "{:<16}  {:<32}  {:<12}  {:<10}  {:<20}  {}",
            item.namespace,
            item.name,
            item.stage,
            item.phase,
            freight,
            item.created_at.format("%Y-%m-%d %H:%M:%S")
        );
    }

    println!("\n{} promotion(s)", items.len());
    Ok(())
}

async fn cmd_show(db: &Db, key: &str) -> anyhow::Result<()> {
    let key: PromotionKey = key.parse()?;
    let Some(item) = db.get(&key).await? else {
        anyhow::bail!("no promotion {key}");
    };

    println!("Promotion:  {}", item.key());
    println!("UID:        {}", item.uid);
    println!("Stage:      {}", item.stage);
    println!("Freight:    {}", item.freight);
    println!("Phase:      {}", item.phase);
    println!("Created:    {}", item.created_at);
    println!("Updated:    {}", item.updated_at);
    if let Some(finished) = item.finished_at {
        println!("Finished:   {finished}");
    }
    if let Some(ref message) = item.message {
        println!("Message:    {message}");
    }
    Ok(())
}

async fn cmd_abort(db: &Db, key: &str) -> anyhow::Result<()> {
    let key: PromotionKey = key.parse()?;
    let Some(current) = db.get(&key).await? else {
        anyhow::bail!("no promotion {key}");
    };
    if current.phase != Phase::Pending {
        anyhow::bail!("{key} is {}; only pending promotions can be aborted", current.phase);
    }
    let item = db
        .update_phase(&key, Phase::Failed, Some("aborted by user"))
        .await?;
    println!("Aborted: {} (phase: {})", item.key(), item.phase);
    Ok(())
}
