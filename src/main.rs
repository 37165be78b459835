use std::{
    fs::{self, OpenOptions},
    io,
    path::PathBuf,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use anyhow::{Context, Result};
use clap::{Arg, ArgMatches, Command};
use crossterm::{
    event::{self, DisableMouseCapture, EnableMouseCapture},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{backend::CrosstermBackend, Terminal};
use tracing::{info, warn};

use bridgeit_chat::chat::{HttpHistoryLoader, OrderingPolicy};
use bridgeit_chat::config::Config;
use bridgeit_chat::credentials::{Credential, CredentialStore};
use bridgeit_chat::hub::HubOptions;
use bridgeit_chat::ChatError;

mod app;
mod ui;

use app::{App, AppSettings};

fn cli() -> Command {
    Command::new("bridgeit-chat")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Terminal client for BridgeIT student/expert chat")
        .arg(
            Arg::new("user")
                .short('u')
                .long("user")
                .value_name("USER_ID")
                .help("Your BridgeIT user id"),
        )
        .arg(
            Arg::new("peer")
                .short('p')
                .long("peer")
                .value_name("USER_ID")
                .help("Open a conversation with this user on startup"),
        )
        .arg(
            Arg::new("api-url")
                .long("api-url")
                .value_name("URL")
                .help("Backend base URL (history endpoint)"),
        )
        .arg(
            Arg::new("hub-url")
                .long("hub-url")
                .value_name("URL")
                .help("Chat hub URL (defaults to <api-url>/chathub)"),
        )
        .arg(
            Arg::new("token")
                .long("token")
                .value_name("JWT")
                .env("BRIDGEIT_TOKEN")
                .hide_env_values(true)
                .help("Bearer token for this run"),
        )
        .arg(
            Arg::new("save-token")
                .long("save-token")
                .action(clap::ArgAction::SetTrue)
                .requires("token")
                .help("Store the given token for later runs and exit"),
        )
        .arg(
            Arg::new("logout")
                .long("logout")
                .action(clap::ArgAction::SetTrue)
                .conflicts_with("save-token")
                .help("Forget the stored token and exit"),
        )
        .arg(
            Arg::new("config")
                .long("config")
                .value_name("PATH")
                .value_parser(clap::value_parser!(PathBuf))
                .help("Config file (defaults to the platform config dir)"),
        )
        .arg(
            Arg::new("ordering")
                .long("ordering")
                .value_name("POLICY")
                .value_parser(["arrival", "time-sent"])
                .help("How to interleave history, received and sent messages"),
        )
        .arg(
            Arg::new("skip-negotiation")
                .long("skip-negotiation")
                .action(clap::ArgAction::SetTrue)
                .help("Connect the hub WebSocket directly without negotiating"),
        )
}

fn init_logging() -> Result<PathBuf> {
    let log_dir = dirs::cache_dir()
        .or_else(|| dirs::home_dir().map(|h| h.join(".cache")))
        .unwrap_or_else(|| PathBuf::from(".cache"))
        .join("bridgeit");
    fs::create_dir_all(&log_dir)?;

    let log_path = log_dir.join("bridgeit-chat.log");
    let file = OpenOptions::new().create(true).append(true).open(&log_path)?;

    // stdout belongs to the TUI
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with_writer(Mutex::new(file))
        .with_ansi(false)
        .init();

    Ok(log_path)
}

fn apply_overrides(config: &mut Config, matches: &ArgMatches) -> Result<()> {
    if let Some(user) = matches.get_one::<String>("user") {
        config.user = Some(user.clone());
    }
    if let Some(peer) = matches.get_one::<String>("peer") {
        config.peer = Some(peer.clone());
    }
    if let Some(url) = matches.get_one::<String>("api-url") {
        config.api_url = Some(url.clone());
    }
    if let Some(url) = matches.get_one::<String>("hub-url") {
        config.hub_url = Some(url.clone());
    }
    if let Some(ordering) = matches.get_one::<String>("ordering") {
        config.ordering = ordering.parse::<OrderingPolicy>().map_err(anyhow::Error::msg)?;
    }
    if matches.get_flag("skip-negotiation") {
        config.skip_negotiation = true;
    }
    Ok(())
}

async fn resolve_credential(store: &CredentialStore, matches: &ArgMatches) -> Result<Option<Credential>> {
    if let Some(token) = matches.get_one::<String>("token") {
        return Ok(Some(Credential::new(token.as_str())?));
    }
    match store.load().await {
        Ok(credential) => Ok(Some(credential)),
        Err(ChatError::AuthMissing) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let matches = cli().get_matches();
    let log_path = init_logging()?;
    info!("bridgeit-chat {} starting", env!("CARGO_PKG_VERSION"));

    let store = CredentialStore::default_location();
    if matches.get_flag("logout") {
        store.clear().await?;
        println!("Signed out.");
        return Ok(());
    }
    if matches.get_flag("save-token") {
        let token = matches.get_one::<String>("token").map(String::as_str).unwrap_or_default();
        store.save(&Credential::new(token)?).await?;
        println!("Token saved to {}", store.path().display());
        return Ok(());
    }

    let config_path = matches
        .get_one::<PathBuf>("config")
        .cloned()
        .unwrap_or_else(Config::default_path);
    let mut config = Config::load(&config_path)
        .with_context(|| format!("reading {}", config_path.display()))?;
    apply_overrides(&mut config, &matches)?;

    let user_id = config.require_user()?.to_string();
    let credential = resolve_credential(&store, &matches).await?;
    if credential.is_none() {
        warn!("no bearer token available");
    }

    let http = config.http_client()?;
    let mut hub_options = HubOptions::new(config.hub_url()?);
    hub_options.skip_negotiation = config.skip_negotiation;
    let settings = AppSettings {
        user_id,
        credential,
        hub_options,
        history: Arc::new(HttpHistoryLoader::new(http.clone(), config.api_url()?)),
        http,
        ordering: config.ordering,
    };

    // Setup terminal
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen, EnableMouseCapture)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let res = match App::new(settings, config.peer.as_deref()).await {
        Ok(mut app) => {
            let res = run_app(&mut terminal, &mut app).await;
            app.shutdown().await;
            res
        }
        Err(e) => Err(e),
    };

    // Restore terminal
    disable_raw_mode()?;
    execute!(
        terminal.backend_mut(),
        LeaveAlternateScreen,
        DisableMouseCapture
    )?;
    terminal.show_cursor()?;

    if let Err(err) = res {
        println!("Error: {:?}", err);
        println!("Details in {}", log_path.display());
    }

    Ok(())
}

async fn run_app(terminal: &mut Terminal<CrosstermBackend<io::Stdout>>, app: &mut App) -> Result<()> {
    let mut last_tick = Instant::now();
    let tick_rate = Duration::from_millis(250);

    loop {
        terminal.draw(|f| ui::draw(f, app))?;

        let timeout_duration = tick_rate
            .checked_sub(last_tick.elapsed())
            .unwrap_or_else(|| Duration::from_secs(0));

        if event::poll(timeout_duration)? {
            let event = event::read()?;
            app.handle_input(event).await?;
        }

        if last_tick.elapsed() >= tick_rate {
            app.on_tick().await?;
            last_tick = Instant::now();
        }

        if app.should_quit {
            return Ok(());
        }
    }
}
