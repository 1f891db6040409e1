use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand, ValueEnum};
use dbseal_core::lifecycle::{recover_abandoned, MIN_PIN_LEN};
use dbseal_core::paths::{data_dir, DEFAULT_DB_FILE_NAME};
use dbseal_core::settings::CONFIG_FILE_NAME;
use dbseal_core::{Controller, ControllerSettings, KeyringCustody, MemoryCustody};
use serde::Serialize;
use std::path::PathBuf;
use tokio::signal;
use tracing::info;
use zeroize::Zeroizing;

const PIN_ENV: &str = "DBSEAL_PIN";

#[derive(Parser, Debug)]
#[command(name = "dbseal")]
#[command(author, version, about = "Keeps the records database encrypted at rest", long_about = None)]
struct Cli {
    /// Directory holding db-encryption.json (and the database by default)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Absolute path of the live database file
    #[arg(long, global = true)]
    db_path: Option<PathBuf>,

    /// Where the PIN is sealed
    #[arg(long, global = true, value_enum, default_value_t = CustodyKind::Keyring)]
    custody: CustodyKind,

    /// Account label for `--custody memory`
    #[arg(long, global = true, default_value = "local")]
    account: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum CustodyKind {
    /// OS credential store
    Keyring,
    /// Deterministic in-process custody (testing only)
    Memory,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show whether encryption is enabled and where the data currently lives
    Status,

    /// Encrypt the database and require the PIN-derived key from now on
    Enable {
        #[arg(long)]
        pin: Option<String>,
    },

    /// Decrypt the database and stop managing a container
    Disable,

    /// Check a PIN against the sealed one
    VerifyPin {
        #[arg(long)]
        pin: Option<String>,
    },

    /// Startup hook: decrypt before the database is opened
    Startup,

    /// Shutdown hook: encrypt after the database is closed
    Shutdown,

    /// Run the startup hook, wait for Ctrl-C, then run the shutdown hook
    Run,

    /// Open a container moved aside by `disable`
    Recover {
        /// The `*.enc.unrecoverable-*` file
        container: PathBuf,
        /// Destination for the recovered database (must not exist)
        #[arg(long)]
        out: PathBuf,
        #[arg(long)]
        pin: Option<String>,
    },
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusReport {
    enabled: bool,
    state: dbseal_core::StorageState,
    database: PathBuf,
    container: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "dbseal=info,dbseal_core=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let controller = build_controller(&cli)?;

    match cli.command {
        Commands::Status => status_command(&controller),
        Commands::Enable { pin } => {
            let pin = read_pin(pin, true)?;
            let outcome = controller.enable(&pin)?;
            print_json(&outcome)?;
            if outcome.restart_required {
                eprintln!("Restart the application to open the encrypted database.");
            }
            Ok(())
        }
        Commands::Disable => {
            let outcome = controller.disable()?;
            print_json(&outcome)
        }
        Commands::VerifyPin { pin } => {
            let pin = read_pin(pin, false)?;
            let ok = controller.verify_pin(&pin)?;
            print_json(&serde_json::json!({ "ok": ok }))?;
            if !ok {
                std::process::exit(1);
            }
            Ok(())
        }
        Commands::Startup => print_json(&controller.ensure_decrypted()),
        Commands::Shutdown => {
            controller.ensure_encrypted_on_exit();
            status_command(&controller)
        }
        Commands::Run => run_command(&controller).await,
        Commands::Recover {
            container,
            out,
            pin,
        } => {
            let pin = read_pin(pin, false)?;
            recover_abandoned(&container, &pin, &out)?;
            println!("Recovered database written to {}", out.display());
            Ok(())
        }
    }
}

fn build_controller(cli: &Cli) -> Result<Controller> {
    let data = match &cli.data_dir {
        Some(dir) => dir.clone(),
        None => data_dir()?,
    };
    std::fs::create_dir_all(&data)?;
    let db_path = cli
        .db_path
        .clone()
        .unwrap_or_else(|| data.join(DEFAULT_DB_FILE_NAME));
    let settings = ControllerSettings::new(db_path, data.join(CONFIG_FILE_NAME));
    let controller = match cli.custody {
        CustodyKind::Keyring => {
            let custody = KeyringCustody::for_database(&settings.database_path);
            Controller::new(settings, custody)
        }
        CustodyKind::Memory => Controller::new(settings, MemoryCustody::new(&cli.account)),
    };
    Ok(controller)
}

fn status_command(controller: &Controller) -> Result<()> {
    let report = StatusReport {
        enabled: controller.status().enabled,
        state: controller.state(),
        database: controller.settings().database_path.clone(),
        container: controller.settings().container_path(),
    };
    print_json(&report)
}

async fn run_command(controller: &Controller) -> Result<()> {
    let session = controller.open_session();
    info!(
        enabled = session.status().enabled,
        db = %controller.settings().database_path.display(),
        "database ready; press Ctrl-C to quit"
    );
    signal::ctrl_c().await?;
    info!("shutting down");
    // The shutdown hook runs here, before main returns.
    drop(session);
    Ok(())
}

fn read_pin(flag: Option<String>, confirm: bool) -> Result<Zeroizing<String>> {
    if let Some(pin) = flag {
        return Ok(Zeroizing::new(pin));
    }
    if let Ok(pin) = std::env::var(PIN_ENV) {
        if !pin.is_empty() {
            return Ok(Zeroizing::new(pin));
        }
    }
    let first = Zeroizing::new(
        rpassword::prompt_password("PIN: ").map_err(|e| anyhow!("PIN prompt: {e}"))?,
    );
    if confirm {
        if first.chars().count() < MIN_PIN_LEN {
            return Err(anyhow!("PIN too short; minimum {MIN_PIN_LEN} characters"));
        }
        let second = Zeroizing::new(
            rpassword::prompt_password("Confirm PIN: ").map_err(|e| anyhow!("PIN prompt: {e}"))?,
        );
        if *first != *second {
            return Err(anyhow!("PINs do not match"));
        }
    }
    Ok(first)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
