//! Admin CLI for a running control plane.
//!
//! Exit codes: 0 success, 1 configuration error, 2 transport error.

use clap::{Parser, Subcommand};
use uuid::Uuid;

const EXIT_CONFIG: i32 = 1;
const EXIT_TRANSPORT: i32 = 2;

#[derive(Parser)]
#[command(name = "shipyard", about = "Admin utilities for the shipyard control plane")]
struct Cli {
    /// Base URL of the daemon's bridge.
    #[arg(long, default_value = "http://127.0.0.1:8400")]
    url: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Seed the default persona templates.
    Seed,
    /// Pool administration.
    Pool {
        #[command(subcommand)]
        action: PoolAction,
    },
    /// Publish a smoke-test event.
    PublishTest {
        /// Target topic: user.messages or story.events.
        #[arg(long, default_value = "user.messages")]
        topic: String,
        /// Project the event belongs to.
        #[arg(long)]
        project: Uuid,
        /// Message content for user.messages events.
        #[arg(long)]
        content: Option<String>,
    },
}

#[derive(Subcommand)]
enum PoolAction {
    /// List pools and their stats.
    List,
    /// Start a named pool.
    Start { name: String },
    /// Stop a named pool.
    Stop { name: String },
}

#[tokio::main]
async fn main() {
    sy_telemetry::init_logging("shipyard-cli", "warn");
    let cli = Cli::parse();

    if !cli.url.starts_with("http://") && !cli.url.starts_with("https://") {
        eprintln!("invalid --url: {}", cli.url);
        std::process::exit(EXIT_CONFIG);
    }

    let client = reqwest::Client::new();
    let outcome = match cli.command {
        Command::Seed => seed(&client, &cli.url).await,
        Command::Pool { action } => pool(&client, &cli.url, action).await,
        Command::PublishTest {
            topic,
            project,
            content,
        } => publish_test(&client, &cli.url, &topic, project, content).await,
    };

    match outcome {
        Ok(()) => {}
        Err(CliError::Config(message)) => {
            eprintln!("{message}");
            std::process::exit(EXIT_CONFIG);
        }
        Err(CliError::Transport(message)) => {
            eprintln!("{message}");
            std::process::exit(EXIT_TRANSPORT);
        }
    }
}

enum CliError {
    Config(String),
    Transport(String),
}

impl From<reqwest::Error> for CliError {
    fn from(err: reqwest::Error) -> Self {
        CliError::Transport(format!("request failed: {err}"))
    }
}

async fn seed(client: &reqwest::Client, base: &str) -> Result<(), CliError> {
    let response = client
        .post(format!("{base}/admin/seed-personas"))
        .send()
        .await?;
    let body: serde_json::Value = response.json().await?;
    println!(
        "seeded {} persona(s)",
        body.get("inserted").and_then(|v| v.as_u64()).unwrap_or(0)
    );
    Ok(())
}

async fn pool(client: &reqwest::Client, base: &str, action: PoolAction) -> Result<(), CliError> {
    match action {
        PoolAction::List => {
            let response = client.get(format!("{base}/admin/pools")).send().await?;
            let body: serde_json::Value = response.json().await?;
            println!("{}", serde_json::to_string_pretty(&body).unwrap_or_default());
        }
        PoolAction::Start { name } => {
            let response = client
                .post(format!("{base}/admin/pools/{name}/start"))
                .send()
                .await?;
            if response.status() == reqwest::StatusCode::NOT_FOUND {
                return Err(CliError::Config(format!("no such pool: {name}")));
            }
            println!("pool {name} started");
        }
        PoolAction::Stop { name } => {
            let response = client
                .post(format!("{base}/admin/pools/{name}/stop"))
                .send()
                .await?;
            if response.status() == reqwest::StatusCode::NOT_FOUND {
                return Err(CliError::Config(format!("no such pool: {name}")));
            }
            println!("pool {name} stopped");
        }
    }
    Ok(())
}

async fn publish_test(
    client: &reqwest::Client,
    base: &str,
    topic: &str,
    project: Uuid,
    content: Option<String>,
) -> Result<(), CliError> {
    if topic != "user.messages" && topic != "story.events" {
        return Err(CliError::Config(format!(
            "unsupported test topic: {topic} (use user.messages or story.events)"
        )));
    }
    let response = client
        .post(format!("{base}/admin/publish-test"))
        .json(&serde_json::json!({
            "topic": topic,
            "project_id": project,
            "content": content,
        }))
        .send()
        .await?;
    if !response.status().is_success() {
        return Err(CliError::Transport(format!(
            "daemon rejected publish: {}",
            response.status()
        )));
    }
    let body: serde_json::Value = response.json().await?;
    println!(
        "published event {}",
        body.get("published").and_then(|v| v.as_str()).unwrap_or("?")
    );
    Ok(())
}
