mod chat;
mod logging;

use std::io::{self, Write};
use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use colored::Colorize;
use copilot_client::{AuthError, Config, CopilotClient, CopilotClientTrait, RequestSpec};

use crate::chat::{ChatCompletion, Conversation};

#[derive(Parser)]
#[command(name = "copilot-cli")]
#[command(about = "Chat with GitHub Copilot from the terminal")]
#[command(version)]
struct Cli {
    /// Path to a config.toml (defaults to ./config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long, short, global = true, default_value = "false")]
    debug: bool,

    /// Print the device code instead of opening a browser
    #[arg(long, global = true, default_value = "false")]
    headless: bool,

    /// Model used for chat completions
    #[arg(long, global = true, default_value = "gpt-4o")]
    model: String,

    /// GitHub token to use instead of the device flow
    #[arg(long, global = true, env = "COPILOT_GITHUB_TOKEN", hide_env_values = true)]
    token: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Log in with the GitHub device flow
    Login,
    /// Send a single message
    Ask {
        /// Message content
        message: String,
    },
    /// Start interactive chat
    Chat,
    /// List the models offered in the model picker
    Models,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init_logging(cli.debug);

    let mut config = match &cli.config {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    };
    if cli.headless {
        config.headless_auth = true;
    }
    let client = CopilotClient::new(config).context("Failed to build the Copilot client")?;

    match cli.command {
        Commands::Login => {
            login(&client, cli.token.as_deref()).await?;
            println!("{}", format!("Status: {}", client.status().await).green());
            print_user(&client).await;
            Ok(())
        }
        Commands::Ask { message } => {
            ensure_logged_in(&client, cli.token.as_deref()).await?;
            let mut conversation = Conversation::new(&cli.model);
            let reply = send_turn(&client, &mut conversation, &message).await?;
            println!("{reply}");
            Ok(())
        }
        Commands::Chat => run_interactive_chat(&client, &cli.model, cli.token.as_deref()).await,
        Commands::Models => {
            ensure_logged_in(&client, cli.token.as_deref()).await?;
            print_models(&client).await
        }
    }
}

/// Device-flow login; Ctrl-C cancels the poller.
async fn login(client: &CopilotClient, token: Option<&str>) -> anyhow::Result<()> {
    if let Some(token) = token {
        client
            .login_with_token(token.to_string())
            .await
            .map_err(explain)?;
        return Ok(());
    }

    let pending = client.start_login().await.map_err(explain)?;
    client.present_login(&pending);
    println!("{}", "Waiting for authorization (Ctrl-C to cancel)...".dimmed());

    let cancel = pending.cancellation();
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });
    let result = client.complete_login(pending).await;
    ctrl_c.abort();

    match result {
        Ok(token) => {
            log::debug!("Service token valid until {}", token.expires_at());
            Ok(())
        }
        Err(e) => Err(explain(e)),
    }
}

async fn ensure_logged_in(client: &CopilotClient, token: Option<&str>) -> anyhow::Result<()> {
    if client.status().await.is_authenticated() {
        return Ok(());
    }
    login(client, token).await
}

/// Turn an auth failure into a message that says what to do next.
fn explain(error: AuthError) -> anyhow::Error {
    let hint = match &error {
        AuthError::Denied | AuthError::DeviceCodeExpired => "Run `copilot-cli login` to start over.",
        AuthError::Unauthorized | AuthError::LoginRequired => {
            "Your GitHub credential was rejected; log in again."
        }
        AuthError::SubscriptionRequired(_) => {
            "Check that your GitHub account has an active Copilot subscription."
        }
        AuthError::ProxyAuthRequired => "Set http_proxy_auth / https_proxy_auth in config.toml.",
        AuthError::Network(_) => "Check your network connection and try again.",
        AuthError::Cancelled | AuthError::Protocol(_) => "",
    };
    if hint.is_empty() {
        anyhow::Error::new(error)
    } else {
        anyhow::Error::new(error).context(hint)
    }
}

async fn send_turn(
    client: &CopilotClient,
    conversation: &mut Conversation,
    message: &str,
) -> anyhow::Result<String> {
    let spec = conversation.ask(message);
    let result = complete(client, spec).await;

    match result {
        Ok(reply) => {
            conversation.record_reply(&reply);
            Ok(reply)
        }
        Err(e) => {
            conversation.discard_last();
            Err(e)
        }
    }
}

async fn complete(client: &CopilotClient, spec: RequestSpec) -> anyhow::Result<String> {
    let response = client.dispatch(spec).await?;
    log::debug!(
        "Completion received after {} attempt(s), request id {}",
        response.attempts,
        response.request_id
    );
    response.json::<ChatCompletion>()?.reply()
}

/// Name the GitHub account; a failed lookup does not undo the login.
async fn print_user(client: &CopilotClient) {
    match client.current_user().await {
        Ok(user) => println!(
            "{}",
            format!("✅ Authenticated as {}", user.display_name()).green()
        ),
        Err(e) => log::warn!("Could not look up the GitHub user: {e}"),
    }
}

async fn print_models(client: &CopilotClient) -> anyhow::Result<()> {
    let models = client.list_models().await?;
    if models.is_empty() {
        println!("{}", "No models available".yellow());
    }
    for model in models {
        println!("  {model}");
    }
    Ok(())
}

async fn run_interactive_chat(
    client: &CopilotClient,
    model: &str,
    token: Option<&str>,
) -> anyhow::Result<()> {
    println!("{}", "🤖 Copilot Chat".cyan().bold());
    println!("{}", format!("Model: {model}").dimmed());
    println!(
        "{}",
        "Commands: /status /login /logout /models /quit".dimmed()
    );
    println!();

    if let Err(e) = ensure_logged_in(client, token).await {
        println!("{}", format!("❌ {e:#}").red());
    }

    let mut conversation = Conversation::new(model);
    loop {
        print!("{} ", "You:".cyan().bold());
        io::stdout().flush()?;

        let mut input = String::new();
        if io::stdin().read_line(&mut input)? == 0 {
            break;
        }
        let input = input.trim();

        match input {
            "" => continue,
            "/quit" | "/exit" => break,
            "/status" => {
                println!("Status: {}", client.status().await);
                if client.status().await.is_authenticated() {
                    print_user(client).await;
                }
                println!("Turns: {}", conversation.turns());
            }
            "/login" => match login(client, token).await {
                Ok(()) => println!("{}", "✅ Logged in".green()),
                Err(e) => println!("{}", format!("❌ {e:#}").red()),
            },
            "/logout" => {
                client.logout().await;
                println!("{}", "Logged out".yellow());
            }
            "/models" => {
                if let Err(e) = print_models(client).await {
                    println!("{}", format!("❌ {e:#}").red());
                }
            }
            message => {
                if !client.status().await.is_authenticated() {
                    println!("{}", "Not logged in, use /login first".yellow());
                    continue;
                }
                match send_turn(client, &mut conversation, message).await {
                    Ok(reply) => {
                        println!("{}", "Assistant:".green().bold());
                        println!("{reply}");
                    }
                    Err(e) => println!("{}", format!("❌ {e:#}").red()),
                }
                println!();
            }
        }
    }

    println!("{}", "👋 Goodbye!".cyan());
    Ok(())
}
