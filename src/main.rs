//! Simple OAuth Login
//!
//! Signs a user in with Google over OpenID Connect and shows the identity
//! claims from the ID token. Runs in the terminal: `login` prints the
//! authorization URL, `callback` completes the login from the URL the browser
//! was sent back to.

mod app;
mod oidc;
mod router;
mod session;
mod storage;
mod views;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};
use url::Url;

use app::App;
use oidc::{OAuthService, OidcConfig, OidcConfigJson, ResponseType};
use router::{ConsoleNavigator, Navigator};
use session::{InitOutcome, SessionManager};
use storage::TokenStore;

/// Command line arguments
#[derive(Parser, Debug)]
#[command(name = "simple-oauth-login")]
#[command(about = "Sign in with Google over OpenID Connect")]
struct Args {
    /// JSON configuration file (kebab-case keys), applied before the flags below
    #[arg(long, env = "OAUTH_CONFIG")]
    config: Option<PathBuf>,

    /// Identity provider issuer URL
    #[arg(long, env = "OAUTH_ISSUER")]
    issuer: Option<String>,

    /// OAuth client ID
    #[arg(long, env = "OAUTH_CLIENT_ID")]
    client_id: Option<String>,

    /// Redirect URI registered with the identity provider
    #[arg(long, env = "OAUTH_REDIRECT_URI")]
    redirect_uri: Option<String>,

    /// Space-separated scopes
    #[arg(long, env = "OAUTH_SCOPE")]
    scope: Option<String>,

    /// Response type ("id_token token" or "code")
    #[arg(long, env = "OAUTH_RESPONSE_TYPE")]
    response_type: Option<ResponseType>,

    /// Require every discovered endpoint to live under the issuer URL
    #[arg(long, env = "OAUTH_STRICT_DISCOVERY")]
    strict_discovery: bool,

    /// Token database path
    #[arg(long, env = "OAUTH_STORAGE")]
    storage: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, env = "OAUTH_VERBOSE")]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
enum Command {
    /// Show the session state and the current view
    Status,
    /// Start a login and print the authorization URL
    Login,
    /// Complete a login from the URL the identity provider redirected to
    Callback {
        /// Redirect URL including its fragment or query
        url: Url,
    },
    /// Print the identity claims of the signed-in user
    Profile,
    /// Print the access token
    Token,
    /// Revoke the tokens and end the session
    Logout,
}

/// Defaults, then the JSON file, then command line flags.
fn build_config(args: &Args) -> Result<OidcConfig> {
    let mut config = OidcConfig::default();

    if let Some(path) = &args.config {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        let json_config: OidcConfigJson = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;
        json_config.apply_to(&mut config);
    }

    if let Some(ref issuer) = args.issuer {
        config.issuer = issuer.clone();
    }
    if let Some(ref client_id) = args.client_id {
        config.client_id = client_id.clone();
    }
    if let Some(ref redirect_uri) = args.redirect_uri {
        config.redirect_uri = redirect_uri.clone();
    }
    if let Some(ref scope) = args.scope {
        config.scope = scope.clone();
    }
    if let Some(response_type) = args.response_type {
        config.response_type = response_type;
    }
    if args.strict_discovery {
        config.strict_discovery_document_validation = true;
    }

    config
        .validate()
        .map_err(|e| anyhow!("Invalid configuration: {}", e))?;

    Ok(config)
}

fn default_storage_path() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".simple-oauth-login")
        .join("session.redb")
}

async fn run(app: &App, command: Command, location: Url) -> Result<()> {
    let outcome = match app.bootstrap(&location).await {
        Ok(outcome) => outcome,
        // Local state is cleared whatever the provider does
        Err(e) if command == Command::Logout => {
            warn!(error = %e, "Session initialization failed, logging out locally");
            InitOutcome::Unauthenticated
        }
        Err(e) => return Err(e),
    };
    let session = app.session();

    match command {
        Command::Status => {
            println!("Session: {:?}\n", session.state());
            print!("{}", app.render());
        }
        Command::Login => {
            app.login_view().sign_in_with_google().await;
        }
        Command::Callback { .. } => {
            if outcome == InitOutcome::Unauthenticated {
                bail!("Redirect URL did not carry a login response");
            }
            print!("{}", app.render());
        }
        Command::Profile => match session.get_profile() {
            Some(profile) => println!("{}", serde_json::to_string_pretty(&profile)?),
            None => bail!("Not signed in"),
        },
        Command::Token => match session.get_token() {
            Some(token) if outcome == InitOutcome::Authenticated => println!("{}", token),
            _ => bail!("No valid access token"),
        },
        Command::Logout => {
            let mut home = app.home_view();
            home.log_out().await;
            home.destroy();
            println!("Signed out.\n");
            print!("{}", app.render());
        }
    }

    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    // Build configuration
    let config = build_config(&args)?;

    // Initialize tracing
    let log_level = if args.verbose || config.show_debug_information {
        "debug"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(format!("{}={}", env!("CARGO_CRATE_NAME"), log_level))
        .with_writer(std::io::stderr)
        .json()
        .init();

    info!(
        issuer = %config.issuer,
        response_type = config.response_type.as_param(),
        strict_discovery = config.strict_discovery_document_validation,
        "Configuration loaded"
    );

    let command = args.command.clone().unwrap_or(Command::Status);
    let location = match &command {
        Command::Callback { url } => url.clone(),
        _ => Url::parse(&config.redirect_uri).context("Invalid redirect URI")?,
    };

    let storage_path = args.storage.clone().unwrap_or_else(default_storage_path);
    let store = Arc::new(TokenStore::open(storage_path.clone())?);
    info!(
        path = ?storage_path,
        pending_logins = store.pending_count().unwrap_or_default(),
        "Token store opened"
    );

    match store.evict_expired() {
        Ok(0) => {}
        Ok(evicted) => debug!(evicted, "Evicted expired pending authorizations"),
        Err(e) => warn!(error = %e, "Failed to evict pending authorizations"),
    }

    let oauth = OAuthService::new(Arc::clone(&store))?;
    let navigator: Arc<dyn Navigator> = Arc::new(ConsoleNavigator::new());
    let session = Arc::new(SessionManager::new(
        config,
        Arc::new(oauth.clone()),
        Arc::clone(&navigator),
    ));
    let app = App::new(Arc::clone(&session), navigator);

    let result = run(&app, command, location).await;

    session.shutdown();
    oauth.shutdown();

    result
}
