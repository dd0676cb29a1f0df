use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use freightlog_api::{ComplianceCheckRequest, EmissionCheckRequest, FreightLogApi};
use freightlog_core::AppendRequest;
use freightlog_rules::{EmissionRequest, ShipmentInput};
use serde_json::Value;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "flog")]
#[command(about = "FreightLog audit and compliance CLI")]
struct Cli {
    #[arg(long, default_value = "./freightlog.sqlite3")]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: Box<DbCommand>,
    },
    Chain {
        #[command(subcommand)]
        command: Box<ChainCommand>,
    },
    Check {
        #[command(subcommand)]
        command: Box<CheckCommand>,
    },
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Subcommand)]
enum ChainCommand {
    Append(ChainAppendArgs),
    Show(ChainSubjectArgs),
    Verify(ChainVerifyArgs),
}

#[derive(Debug, Args)]
struct ChainAppendArgs {
    #[arg(long)]
    subject_id: String,
    #[arg(long)]
    action: String,
    #[arg(long)]
    actor_id: Option<String>,
    #[arg(long, default_value = "{}")]
    payload: String,
    #[arg(long)]
    timestamp_ms: Option<i64>,
}

#[derive(Debug, Args)]
struct ChainSubjectArgs {
    #[arg(long)]
    subject_id: String,
}

#[derive(Debug, Args)]
struct ChainVerifyArgs {
    #[arg(long, conflicts_with = "all")]
    subject_id: Option<String>,
    #[arg(long, default_value_t = false)]
    all: bool,
}

#[derive(Debug, Subcommand)]
enum CheckCommand {
    Compliance(CheckComplianceArgs),
    Emissions(CheckEmissionsArgs),
}

#[derive(Debug, Args)]
struct CheckComplianceArgs {
    #[arg(long)]
    subject_id: String,
    #[arg(long)]
    actor_id: Option<String>,
    #[arg(long)]
    un_code: Option<String>,
    #[arg(long)]
    transport_mode: String,
    #[arg(long)]
    cargo_type: String,
    #[arg(long)]
    weight_kg: f64,
}

#[derive(Debug, Args)]
struct CheckEmissionsArgs {
    #[arg(long)]
    subject_id: String,
    #[arg(long)]
    actor_id: Option<String>,
    #[arg(long)]
    origin: String,
    #[arg(long)]
    destination: String,
    #[arg(long)]
    transport_mode: String,
    #[arg(long)]
    weight_kg: f64,
    #[arg(long)]
    distance_km: Option<f64>,
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let api = FreightLogApi::new(cli.db);
    match cli.command {
        Command::Db { command } => run_db(*command, &api),
        Command::Chain { command } => run_chain(*command, &api),
        Command::Check { command } => run_check(*command, &api),
    }
}

fn run_db(command: DbCommand, api: &FreightLogApi) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => {
            let status = api.schema_status()?;
            emit_json(serde_json::json!({
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions,
                "up_to_date": status.pending_versions.is_empty()
            }))
        }
        DbCommand::Migrate(args) => {
            let result = api.migrate(args.dry_run)?;
            emit_json(serde_json::to_value(&result).context("failed to serialize migrate result")?)
        }
    }
}

fn run_chain(command: ChainCommand, api: &FreightLogApi) -> Result<()> {
    match command {
        ChainCommand::Append(args) => {
            let payload: Value = serde_json::from_str(&args.payload)
                .context("--payload must be a valid JSON document")?;
            let record = api.record_decision(AppendRequest {
                subject_id: args.subject_id,
                action: args.action,
                actor_id: args.actor_id,
                payload,
                timestamp_ms: args.timestamp_ms,
            })?;
            emit_json(serde_json::to_value(&record).context("failed to serialize record")?)
        }
        ChainCommand::Show(args) => {
            let chain = api.chain_show(&args.subject_id)?;
            emit_json(serde_json::json!({
                "subject_id": args.subject_id,
                "chain_length": chain.len(),
                "records": chain
            }))
        }
        ChainCommand::Verify(args) => {
            if args.all {
                let result = api.chain_verify_all()?;
                return emit_json(
                    serde_json::to_value(&result).context("failed to serialize verify result")?,
                );
            }

            let subject_id = args
                .subject_id
                .context("chain verify requires --subject-id or --all")?;
            let result = api.chain_verify(&subject_id)?;
            emit_json(serde_json::to_value(&result).context("failed to serialize verify result")?)
        }
    }
}

fn run_check(command: CheckCommand, api: &FreightLogApi) -> Result<()> {
    match command {
        CheckCommand::Compliance(args) => {
            let outcome = api.compliance_check(ComplianceCheckRequest {
                subject_id: args.subject_id,
                actor_id: args.actor_id,
                shipment: ShipmentInput {
                    un_code: args.un_code,
                    transport_mode: args.transport_mode,
                    cargo_type: args.cargo_type,
                    weight_kg: args.weight_kg,
                },
            })?;
            emit_json(serde_json::to_value(&outcome).context("failed to serialize outcome")?)
        }
        CheckCommand::Emissions(args) => {
            let outcome = api.emission_check(EmissionCheckRequest {
                subject_id: args.subject_id,
                actor_id: args.actor_id,
                request: EmissionRequest {
                    origin: args.origin,
                    destination: args.destination,
                    transport_mode: args.transport_mode,
                    weight_kg: args.weight_kg,
                    distance_km: args.distance_km,
                },
            })?;
            emit_json(serde_json::to_value(&outcome).context("failed to serialize outcome")?)
        }
    }
}
