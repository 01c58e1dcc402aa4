use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use kasa_core::appid;
use kasa_core::assistant::{AssistantClient, CancelToken, ChatSession, ExchangeOutcome};
use kasa_core::config::{AssistantCfg, Config, HttpCfg, SupabaseCfg};
use kasa_core::model::{ApplicationStatus, NewApplication, SignageType, StatusPatch};
use kasa_core::normalizer::normalize_application;
use kasa_core::store::{MemoryStore, RecordStore, RestStore};

#[derive(Parser)]
#[command(author, version, about = "KASA signage permit CLI", long_about = None)]
struct Cli {
    /// Path to a JSON or TOML config file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Ask the KASA assistant a question (prints the reply as it streams)
    Chat {
        #[arg(short, long, help = "Message from the user")]
        message: String,
    },
    /// Submit a new signage permit application
    Apply {
        #[arg(long)]
        business_name: String,
        #[arg(long)]
        email: String,
        #[arg(long)]
        phone: Option<String>,
        #[arg(long, help = "billboard, banner, neon-sign, led-display, wall-mount, vehicle-wrap, other")]
        signage_type: String,
        #[arg(long)]
        location: Option<String>,
        #[arg(long)]
        description: Option<String>,
    },
    /// Verify a permit application by its shareable id
    Verify {
        #[arg(long)]
        id: String,
    },
    /// List applications, newest first
    List {
        #[arg(long, help = "pending_payment, paid, approved, rejected, expired")]
        status: Option<String>,
    },
    /// Move an application to a new status (admin workflow)
    SetStatus {
        #[arg(long)]
        id: String,
        #[arg(long)]
        status: String,
    },
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<Option<Config>> {
    if let Some(p) = path {
        return Ok(Some(Config::from_path(p)?));
    }
    if let Ok(url) = std::env::var("KASA_SUPABASE_URL") {
        return Ok(Some(Config {
            supabase: SupabaseCfg {
                url,
                publishable_key_env: "KASA_PUBLISHABLE_KEY".into(),
                service_key_env: std::env::var("KASA_SERVICE_KEY")
                    .ok()
                    .map(|_| "KASA_SERVICE_KEY".to_string()),
            },
            site_url: std::env::var("KASA_SITE_URL")
                .unwrap_or_else(|_| "https://kasa.example".into()),
            assistant: AssistantCfg::default(),
            http: HttpCfg::default(),
        }));
    }
    Ok(None)
}

fn open_store(cfg: Option<&Config>) -> anyhow::Result<Arc<dyn RecordStore>> {
    match cfg {
        Some(cfg) => Ok(Arc::new(RestStore::from_config(cfg)?)),
        None => {
            eprintln!("no config found; using an in-memory store (records are not persisted)");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

fn print_application(app: &kasa_core::model::SignageApplication) {
    println!("{}  {}", app.application_id, app.status.label());
    println!("  business: {}", app.business_name);
    if let Some(loc) = &app.location {
        println!("  location: {loc}");
    }
    println!("  due NGN {:.2}, paid NGN {:.2}", app.amount_due, app.amount_paid);
    if let Some(d) = app.issued_date {
        println!("  issued:  {}", d.to_rfc3339());
    }
    if let Some(d) = app.expiry_date {
        println!("  expires: {}", d.to_rfc3339());
    }
    println!("  applied: {}", app.created_at.to_rfc3339());
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    let cfg = load_config(cli.config.as_ref())?;

    match cli.command {
        Commands::Chat { message } => {
            let cfg = cfg.ok_or_else(|| {
                anyhow::anyhow!("chat needs a config file or KASA_SUPABASE_URL set")
            })?;
            let client = AssistantClient::from_config(&cfg)?;
            let mut session = ChatSession::from_config(&cfg);
            session.push_user(message);

            let mut printed = 0usize;
            let outcome = session
                .run(&client, &CancelToken::new(), |snapshot| {
                    print!("{}", &snapshot[printed..]);
                    io::stdout().flush().ok();
                    printed = snapshot.len();
                })
                .await?;
            if outcome == ExchangeOutcome::FellBack {
                // Any partial text already on screen is stale; the final
                // assistant message holds the fallback notice.
                if printed > 0 {
                    println!();
                }
                if let Some(last) = session.messages().last() {
                    print!("{}", last.content);
                }
            }
            println!();
        }
        Commands::Apply {
            business_name,
            email,
            phone,
            signage_type,
            location,
            description,
        } => {
            let signage_type = SignageType::parse(&signage_type)
                .ok_or_else(|| anyhow::anyhow!("unknown signage type: {signage_type}"))?;
            let store = open_store(cfg.as_ref())?;
            let app = normalize_application(NewApplication {
                application_id: appid::generate(),
                business_name,
                email,
                phone,
                signage_type,
                location,
                description,
            })?;
            let row = store.insert(app).await?;
            println!("application submitted: {}", row.application_id);
            println!("status: {}", row.status.label());
            let site = cfg
                .as_ref()
                .map(|c| c.site_url.clone())
                .unwrap_or_else(|| "https://kasa.example".into());
            println!("verify: {}", appid::verify_url(&site, &row.application_id));
        }
        Commands::Verify { id } => {
            let id = id.trim().to_string();
            if !appid::is_valid(&id) {
                anyhow::bail!("not a valid application id: {id}");
            }
            let store = open_store(cfg.as_ref())?;
            match store.find(&id).await? {
                Some(app) => print_application(&app),
                None => println!("no application found with this ID"),
            }
        }
        Commands::List { status } => {
            let status = match status.as_deref() {
                Some(s) => Some(
                    ApplicationStatus::parse(s)
                        .ok_or_else(|| anyhow::anyhow!("unknown status: {s}"))?,
                ),
                None => None,
            };
            let store = open_store(cfg.as_ref())?;
            for app in store.list(status).await? {
                print_application(&app);
            }
        }
        Commands::SetStatus { id, status } => {
            let id = id.trim().to_string();
            if !appid::is_valid(&id) {
                anyhow::bail!("not a valid application id: {id}");
            }
            let new_status = ApplicationStatus::parse(&status)
                .ok_or_else(|| anyhow::anyhow!("unknown status: {status}"))?;
            let store = open_store(cfg.as_ref())?;
            let app = store
                .find(&id)
                .await?
                .ok_or_else(|| anyhow::anyhow!("no application found with id {id}"))?;
            let patch = StatusPatch::for_transition(&app, new_status, chrono::Utc::now());
            let updated = store.update_status(&app.id, patch).await?;
            println!("{} -> {}", updated.application_id, updated.status.label());
        }
    }

    Ok(())
}
