//! Console front-end for the assistant bot.
//!
//! Stands in for the chat platform: every stdin line is one incoming message
//! from the current user.

use agent_host::{user_message, AgentHost, CheckActionReply};
use anyhow::{Context, Result};
use providers::{AssistantsClient, OpenAIClient};
use services::Database;
use shared::settings::{is_truthy, BotSettings};
use shared::ClarificationState;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing_subscriber::EnvFilter;

const HELP: &str = "\
Команды:
  /forecast <вопрос>   прогноз (то же, что просто текст)
  /check <действие>    проверить действие
  /mode                переключить режим FREE/PRO
  /user <id>           сменить пользователя
  /quit                выход";

fn init_tracing(debug_mode: bool) {
    let default_level = std::env::var("LOG_LEVEL")
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| if debug_mode { "debug" } else { "info" }.to_string());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn database_path(settings: &BotSettings) -> Result<PathBuf> {
    if let Some(path) = &settings.database_path {
        return Ok(path.clone());
    }
    let proj = directories::ProjectDirs::from("com.local", "Astro Oracle", "AstroOracle")
        .context("no home directory to place the database in")?;
    std::fs::create_dir_all(proj.data_dir())
        .with_context(|| format!("failed to create {}", proj.data_dir().display()))?;
    Ok(proj.data_dir().join("bot.db"))
}

/// Per-console session: who is talking and where their check-action flow stands
struct Session {
    user_id: i64,
    clarifications: HashMap<i64, ClarificationState>,
}

impl Session {
    fn clarification(&mut self) -> &mut ClarificationState {
        self.clarifications.entry(self.user_id).or_default()
    }
}

async fn handle_line(host: &AgentHost, session: &mut Session, line: &str) -> String {
    let (command, rest) = match line.split_once(char::is_whitespace) {
        Some((command, rest)) => (command, rest.trim()),
        None => (line, ""),
    };

    match command {
        "/help" => HELP.to_string(),
        "/mode" => match host.switch_mode(session.user_id).await {
            Ok(Some(mode)) => format!("Режим: {}", mode.display_name()),
            Ok(None) => agent_host::prompts::MSG_MODE_SWITCH_UNAVAILABLE.to_string(),
            Err(e) => {
                tracing::error!(user_id = session.user_id, error = ?e, "mode switch failed");
                agent_host::prompts::MSG_SERVICE_UNAVAILABLE.to_string()
            }
        },
        "/user" => match rest.parse::<i64>() {
            Ok(user_id) => {
                session.user_id = user_id;
                format!(
                    "Пользователь {} (режим {})",
                    user_id,
                    host.user_mode(user_id).await.display_name()
                )
            }
            Err(_) => "Укажите числовой id: /user 42".to_string(),
        },
        "/check" => {
            // A new /check always starts over
            session.clarification().reset();
            check(host, session, rest).await
        }
        "/forecast" => forecast(host, session, rest).await,
        _ if line.starts_with('/') => HELP.to_string(),
        _ if session.clarification().is_clarifying() => check(host, session, line).await,
        _ => forecast(host, session, line).await,
    }
}

async fn check(host: &AgentHost, session: &mut Session, text: &str) -> String {
    let user_id = session.user_id;
    let reply = host
        .check_action(session.clarification(), user_id, text)
        .await;
    if let CheckActionReply::Answer(outcome) = &reply {
        if !outcome.is_success() {
            return format!("{}\n\n{}", user_message(outcome), HELP);
        }
    }
    reply.text().to_string()
}

async fn forecast(host: &AgentHost, session: &mut Session, text: &str) -> String {
    if text.is_empty() {
        return "Напишите вопрос после /forecast".to_string();
    }
    let outcome = host.forecast(session.user_id, text).await;
    user_message(&outcome).to_string()
}

#[tokio::main]
async fn main() -> Result<()> {
    // Before settings, so warnings raised while loading them are printed
    init_tracing(std::env::var("DEBUG_MODE").is_ok_and(|v| is_truthy(&v)));
    let settings = BotSettings::from_env().context("invalid configuration")?;

    let db_path = database_path(&settings)?;
    let db = Arc::new(Database::open(&db_path)?);
    tracing::info!(path = %db_path.display(), "database ready");

    let backend = AssistantsClient::new(
        &settings.api_key,
        Some(settings.base_url.as_str()),
        settings.runs.http_timeout(),
    )?;
    let classifier = OpenAIClient::new(
        &settings.api_key,
        &settings.classifier.model,
        Some(settings.base_url.as_str()),
        settings.runs.http_timeout(),
    )?;
    let host = AgentHost::new(&settings, db, Arc::new(backend), Arc::new(classifier));

    let mut session = Session {
        user_id: 1,
        clarifications: HashMap::new(),
    };
    let mut stdout = tokio::io::stdout();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    stdout.write_all(format!("{}\n> ", HELP).as_bytes()).await?;
    stdout.flush().await?;

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line == "/quit" {
            break;
        }
        if !line.is_empty() {
            let reply = handle_line(&host, &mut session, line).await;
            stdout.write_all(format!("{}\n", reply).as_bytes()).await?;
        }
        stdout.write_all(b"> ").await?;
        stdout.flush().await?;
    }

    tracing::info!("bye");
    Ok(())
}
