//! idgate - command line front end for an identity service session.
//!
//! Remembered sessions are kept encrypted in the data directory and picked
//! up by later invocations. Sessions that are not remembered live only as
//! long as the process.

use std::io::{self, Write};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use idgate_core::models::LoginRequest;
use idgate_core::{Config, FileStore, IdentityClient, MemoryStore};

const USAGE: &str = "\
Usage: idgate <command> [args]

Commands:
  login <username> [--remember] [--code <totp>]
                       Log in; --remember keeps the session across runs
  logout               End the session and wipe stored credentials
  status               Show the current session state
  profile              Show the logged-in user's profile
  users [page]         List users (admin only)
  help                 Show this message

Environment:
  IDGATE_API_BASE_URL, IDGATE_API_KEY, IDGATE_VAULT_PASSPHRASE
  RUST_LOG             Log filter (default: warn)";

/// Default page size for the user listing
const USERS_PAGE_SIZE: u32 = 20;

/// Initialize the tracing subscriber for logging
fn init_tracing() {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(filter)
        .init();
}

enum Command {
    Login {
        username: String,
        remember: bool,
        code: Option<String>,
    },
    Logout,
    Status,
    Profile,
    Users { page: u32 },
    Help,
}

fn parse_args(args: &[String]) -> Result<Command> {
    let Some(command) = args.first() else {
        return Ok(Command::Help);
    };

    match command.as_str() {
        "login" => {
            let mut username = None;
            let mut remember = false;
            let mut code = None;
            let mut rest = args[1..].iter();
            while let Some(arg) = rest.next() {
                match arg.as_str() {
                    "--remember" => remember = true,
                    "--code" => {
                        code = Some(rest.next().context("--code needs a value")?.clone());
                    }
                    other if other.starts_with("--") => bail!("Unknown option: {}", other),
                    other => username = Some(other.to_string()),
                }
            }
            Ok(Command::Login {
                username: username.context("login needs a username")?,
                remember,
                code,
            })
        }
        "logout" => Ok(Command::Logout),
        "status" => Ok(Command::Status),
        "profile" => Ok(Command::Profile),
        "users" => {
            let page = match args.get(1) {
                Some(page) => page.parse().with_context(|| format!("Invalid page number: {}", page))?,
                None => 1,
            };
            Ok(Command::Users { page })
        }
        "help" | "--help" | "-h" => Ok(Command::Help),
        other => bail!("Unknown command: {}\n\n{}", other, USAGE),
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    let mut stdout = io::stdout().lock();
    serde_json::to_writer_pretty(&mut stdout, value)?;
    writeln!(stdout)?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();
    init_tracing();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let command = parse_args(&args)?;
    if let Command::Help = command {
        println!("{}", USAGE);
        return Ok(());
    }

    let mut config = Config::load()?;
    let data_dir = config.data_dir()?;
    let client = IdentityClient::from_config(
        &config,
        Arc::new(FileStore::new(&data_dir)),
        Arc::new(MemoryStore::new()),
    )?;
    client.session().ready().await;
    info!(base_url = %config.base_url, "idgate starting");

    match command {
        Command::Login { username, remember, code } => {
            let password = rpassword::prompt_password(format!("Password for {}: ", username))?;
            let request = LoginRequest {
                username: username.clone(),
                password,
                totp_code: code,
            };
            let profile = client.login(&request, remember).await?;

            config.last_username = Some(username);
            if let Err(e) = config.save() {
                tracing::warn!(error = %e, "Failed to save config");
            }
            print_json(&profile)?;
        }
        Command::Logout => {
            client.logout().await;
            eprintln!("Logged out.");
        }
        Command::Status => print_json(&client.current_state())?,
        Command::Profile => print_json(&client.get_profile().await?)?,
        Command::Users { page } => print_json(&client.list_users(page, USERS_PAGE_SIZE).await?)?,
        Command::Help => {}
    }

    Ok(())
}
