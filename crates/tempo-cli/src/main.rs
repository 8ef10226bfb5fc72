//! tempo — calendar archiving assistant.
//!
//! Archives and normalizes calendar appointments into a curated, immutable
//! archive, files manual-resolution tasks for what cannot be resolved
//! mechanically, and can reverse any completed archive run.

use chrono::{Duration, Utc};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tempo_archive::{
    ArchiveOrchestrator, ArchiveRequest, ArchiveReverser, RepositoryProvider,
    StandardRepositoryProvider,
};
use tempo_audit::AuditLedger;
use tempo_ledger::ReversibleLedger;
use tempo_proto::{ArchivePurpose, ArchiveStatus, CancelToken, User};
use tempo_repo::{GraphCalendarClient, TokenCache};
use tempo_store::{Database, Session};
use tempo_uri::{CalendarDirectory, CalendarInfo, UriError};
use tracing::warn;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod configs;
mod dates;
mod users;

const EXIT_OK: i32 = 0;
const EXIT_ERROR: i32 = 1;
const EXIT_USAGE: i32 = 2;

const TOKEN_ENV_VAR: &str = "TEMPO_GRAPH_TOKEN";

#[derive(Parser)]
#[command(name = "tempo")]
#[command(about = "Calendar archiving assistant")]
#[command(version)]
struct Cli {
    /// State directory for the local database
    #[arg(long, global = true, default_value = ".tempo")]
    state_dir: PathBuf,

    /// User identifier (numeric id or email)
    #[arg(long, global = true)]
    user: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Archive appointments per a named configuration
    Archive {
        /// Archive configuration name
        config: String,

        /// Date or date range (e.g. "yesterday", "last week", "1-6 to 15-6")
        #[arg(long, default_value = "yesterday")]
        date: String,
    },

    /// Category-filtered archive for timesheet/billing purposes
    Timesheet {
        /// Archive configuration name
        config: String,

        /// Date or date range
        #[arg(long, default_value = "yesterday")]
        date: String,

        /// Include travel appointments detected by subject keywords
        #[arg(long)]
        travel: bool,
    },

    /// Inspect and reverse completed archive operations
    Recovery {
        #[command(subcommand)]
        command: RecoveryCommands,
    },

    /// Manage archive configurations
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand)]
enum RecoveryCommands {
    /// List reversible operations, newest first
    List {
        /// Maximum number of operations to show
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },

    /// Show one operation with its items
    Show {
        /// Operation id
        op_id: i64,
    },

    /// Reverse a completed operation
    Reverse {
        /// Operation id
        op_id: i64,

        /// Reason for the reversal
        #[arg(long, default_value = "manual reversal")]
        reason: String,

        /// Check and report without mutating anything
        #[arg(long)]
        dry_run: bool,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Create an archive configuration
    Create {
        /// Configuration name
        name: String,

        /// Source calendar URI (e.g. msgraph://calendars/primary)
        #[arg(long)]
        source: String,

        /// Destination calendar URI (e.g. local://calendars/archive)
        #[arg(long)]
        destination: String,

        /// IANA timezone name
        #[arg(long, default_value = "UTC")]
        timezone: String,

        /// Keep overlapping appointments instead of resolving them away
        #[arg(long)]
        allow_overlaps: bool,

        /// Archive purpose: general, timesheet, billing, travel
        #[arg(long, default_value = "general")]
        purpose: String,
    },

    /// List configurations for the user
    List,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let code = run(cli).await;
    std::process::exit(code);
}

/// Directory used when no provider client is configured: resolution falls
/// back to identifiers verbatim.
struct EmptyDirectory;

#[async_trait::async_trait]
impl CalendarDirectory for EmptyDirectory {
    async fn list_calendars(&self, _user: &User) -> Result<Vec<CalendarInfo>, UriError> {
        Ok(Vec::new())
    }
}

struct Runtime {
    session: Session,
    client: Option<Arc<GraphCalendarClient>>,
}

impl Runtime {
    fn open(state_dir: &std::path::Path) -> Self {
        let db = Database::open(state_dir);
        let session = db.begin();

        let client = match std::env::var(TOKEN_ENV_VAR) {
            Ok(token) if !token.is_empty() => {
                let tokens = Arc::new(TokenCache::new());
                tokens.store(token, Utc::now() + Duration::minutes(55));
                match GraphCalendarClient::new(tokens) {
                    Ok(client) => Some(Arc::new(client)),
                    Err(e) => {
                        warn!(error = %e, "failed to build provider client");
                        None
                    }
                }
            }
            _ => None,
        };

        Self { session, client }
    }

    fn directory(&self) -> Arc<dyn CalendarDirectory> {
        match &self.client {
            Some(client) => client.clone(),
            None => Arc::new(EmptyDirectory),
        }
    }

    fn repositories(&self) -> Arc<dyn RepositoryProvider> {
        Arc::new(StandardRepositoryProvider::new(
            self.session.clone(),
            self.client.clone(),
        ))
    }

    fn resolve_user(&self, input: Option<&str>) -> Result<User, i32> {
        users::UserStore::new(self.session.clone())
            .resolve(input)
            .map_err(|e| {
                eprintln!("{e}");
                EXIT_USAGE
            })
    }
}

async fn run(cli: Cli) -> i32 {
    let runtime = Runtime::open(&cli.state_dir);

    match cli.command {
        Commands::Archive { config, date } => {
            run_archive(&runtime, cli.user.as_deref(), &config, &date, None).await
        }
        Commands::Timesheet {
            config,
            date,
            travel,
        } => run_archive(&runtime, cli.user.as_deref(), &config, &date, Some(travel)).await,
        Commands::Recovery { command } => run_recovery(&runtime, cli.user.as_deref(), command).await,
        Commands::Config { command } => run_config(&runtime, cli.user.as_deref(), command),
    }
}

/// `timesheet` is the archive command with `archive_purpose = timesheet`.
async fn run_archive(
    runtime: &Runtime,
    cli_user: Option<&str>,
    config_name: &str,
    date: &str,
    timesheet_travel: Option<bool>,
) -> i32 {
    let user = match runtime.resolve_user(cli_user) {
        Ok(user) => user,
        Err(code) => return code,
    };

    let (start_date, end_date) = match dates::parse_date_range(date, Utc::now().date_naive()) {
        Ok(range) => range,
        Err(e) => {
            eprintln!("{e}");
            return EXIT_USAGE;
        }
    };

    let configs = configs::ConfigStore::new(runtime.session.clone());
    let config = match configs.get_active(user.id, config_name) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            return EXIT_ERROR;
        }
    };

    let purpose = match timesheet_travel {
        Some(_) => ArchivePurpose::Timesheet,
        None => ArchivePurpose::General,
    };

    let orchestrator = ArchiveOrchestrator::new(
        runtime.session.clone(),
        runtime.directory(),
        runtime.repositories(),
    );
    let request = ArchiveRequest {
        user,
        source_uri: config.source_calendar_uri.clone(),
        destination_uri: config.destination_calendar_uri.clone(),
        start_date,
        end_date,
        allow_overlaps: config.allow_overlaps,
        archive_purpose: purpose,
        include_travel: timesheet_travel.unwrap_or(false),
        cancel: CancelToken::new(),
    };

    let result = orchestrator.run(&request).await;
    match serde_json::to_string_pretty(&result) {
        Ok(rendered) => println!("{rendered}"),
        Err(e) => eprintln!("failed to render result: {e}"),
    }
    match result.status {
        ArchiveStatus::Error => EXIT_ERROR,
        _ => EXIT_OK,
    }
}

async fn run_recovery(runtime: &Runtime, cli_user: Option<&str>, command: RecoveryCommands) -> i32 {
    let user = match runtime.resolve_user(cli_user) {
        Ok(user) => user,
        Err(code) => return code,
    };
    let audit = AuditLedger::new(runtime.session.clone());
    let ledger = ReversibleLedger::new(runtime.session.clone(), audit);

    match command {
        RecoveryCommands::List { limit } => {
            let operations = match ledger.list_operations(Some(user.id), None, None, Some(limit)) {
                Ok(operations) => operations,
                Err(e) => {
                    eprintln!("{e}");
                    return EXIT_ERROR;
                }
            };
            if operations.is_empty() {
                println!("No reversible operations found.");
                return EXIT_OK;
            }
            for op in operations {
                let state = if op.is_reversed {
                    "reversed"
                } else if op.is_reversible {
                    "reversible"
                } else {
                    "not reversible"
                };
                println!(
                    "{:>6}  {}  {}  [{}]  correlation={}",
                    op.id.unwrap_or_default(),
                    op.created_at.format("%Y-%m-%d %H:%M"),
                    op.operation_name,
                    state,
                    op.correlation_id,
                );
            }
            EXIT_OK
        }

        RecoveryCommands::Show { op_id } => {
            let operation = match ledger.get_operation(op_id) {
                Ok(operation) => operation,
                Err(e) => {
                    eprintln!("{e}");
                    return EXIT_ERROR;
                }
            };
            let items = ledger.items_for(op_id).unwrap_or_default();
            let view = serde_json::json!({
                "operation": operation,
                "items": items,
            });
            match serde_json::to_string_pretty(&view) {
                Ok(rendered) => println!("{rendered}"),
                Err(e) => eprintln!("failed to render operation: {e}"),
            }
            EXIT_OK
        }

        RecoveryCommands::Reverse {
            op_id,
            reason,
            dry_run,
        } => {
            let reverser = ArchiveReverser::new(runtime.repositories(), user.clone());
            let outcome = match ledger
                .reverse_operation(op_id, user.id, &reason, dry_run, &reverser)
                .await
            {
                Ok(outcome) => outcome,
                Err(e) => {
                    eprintln!("{e}");
                    return EXIT_ERROR;
                }
            };
            if !dry_run && outcome.success {
                if let Err(e) = runtime.session.commit() {
                    eprintln!("failed to commit reversal: {e}");
                    return EXIT_ERROR;
                }
            }
            match serde_json::to_string_pretty(&outcome) {
                Ok(rendered) => println!("{rendered}"),
                Err(e) => eprintln!("failed to render outcome: {e}"),
            }
            if outcome.success {
                EXIT_OK
            } else {
                EXIT_ERROR
            }
        }
    }
}

fn run_config(runtime: &Runtime, cli_user: Option<&str>, command: ConfigCommands) -> i32 {
    let user = match runtime.resolve_user(cli_user) {
        Ok(user) => user,
        Err(code) => return code,
    };
    let configs = configs::ConfigStore::new(runtime.session.clone());

    match command {
        ConfigCommands::Create {
            name,
            source,
            destination,
            timezone,
            allow_overlaps,
            purpose,
        } => {
            let purpose = match purpose.as_str() {
                "general" => ArchivePurpose::General,
                "timesheet" => ArchivePurpose::Timesheet,
                "billing" => ArchivePurpose::Billing,
                "travel" => ArchivePurpose::Travel,
                other => {
                    eprintln!("unknown archive purpose '{other}'");
                    return EXIT_USAGE;
                }
            };
            match configs.create(
                user.id,
                &name,
                &source,
                &destination,
                &timezone,
                allow_overlaps,
                purpose,
            ) {
                Ok(config) => {
                    if let Err(e) = runtime.session.commit() {
                        eprintln!("failed to save configuration: {e}");
                        return EXIT_ERROR;
                    }
                    println!(
                        "Created configuration '{}' ({} -> {})",
                        config.name, config.source_calendar_uri, config.destination_calendar_uri
                    );
                    EXIT_OK
                }
                Err(e) => {
                    eprintln!("{e}");
                    EXIT_ERROR
                }
            }
        }

        ConfigCommands::List => match configs.list(user.id) {
            Ok(list) if list.is_empty() => {
                println!("No archive configurations.");
                EXIT_OK
            }
            Ok(list) => {
                for config in list {
                    println!(
                        "{}  {} -> {}  purpose={} active={}",
                        config.name,
                        config.source_calendar_uri,
                        config.destination_calendar_uri,
                        config.archive_purpose,
                        config.is_active,
                    );
                }
                EXIT_OK
            }
            Err(e) => {
                eprintln!("{e}");
                EXIT_ERROR
            }
        },
    }
}
