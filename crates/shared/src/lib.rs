pub mod conversation;
pub mod outcome;
pub mod validation;

pub use conversation::{
    ConversationContext, ConversationKey, MessageRole, Mode, RunHandle, RunStatus, ThreadMessage,
};
pub use outcome::{CallOutcome, RunError, RunTimeoutDetails};
pub use validation::{ClarificationState, FailureKind, ValidationResult};

pub mod settings {
    use serde::{Deserialize, Serialize};
    use std::collections::BTreeSet;
    use std::env;
    use std::path::PathBuf;
    use std::time::Duration;

    use crate::conversation::Mode;

    const DEFAULT_BASE_URL: &str = "https://api.openai.com";

    #[derive(Debug, thiserror::Error)]
    pub enum SettingsError {
        #[error("{0} is not set in the environment")]
        Missing(&'static str),

        #[error("{name} has an invalid value: {value}")]
        Invalid { name: &'static str, value: String },
    }

    /// Backend identifiers per billing tier
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct AssistantIds {
        pub free: String,
        pub pro: String,
    }

    impl AssistantIds {
        pub fn for_mode(&self, mode: Mode) -> &str {
            match mode {
                Mode::Free => &self.free,
                Mode::Pro => &self.pro,
            }
        }
    }

    /// Parameters for the cheap action classifier
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct ClassifierSettings {
        pub model: String,             // e.g., "gpt-4o-mini"
        pub max_tokens: u32,
        pub temperature: f32,
        pub timeout_secs: u64,
    }

    /// Run polling and call guard limits
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct RunSettings {
        /// Client-side ceiling for waiting on a single run
        pub run_wait_secs: u64,
        /// Added on top of `run_wait_secs` for the outer guard deadline
        pub guard_slack_secs: u64,
        pub poll_interval_ms: u64,
        pub http_timeout_secs: u64,
        /// Backend calls allowed in flight at once
        pub worker_pool_size: usize,
        /// Calls allowed to wait for a worker before being turned away
        pub worker_queue_depth: usize,
    }

    /// Who may flip between FREE and PRO
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "lowercase")]
    pub enum ModeSwitchVisibility {
        #[default]
        Public,
        /// Only users listed in `mode_switch_users`
        Testers,
        Off,
    }

    impl ModeSwitchVisibility {
        /// Unknown values fall back to `Public`.
        pub fn parse(raw: &str) -> Self {
            match raw.trim().to_ascii_lowercase().as_str() {
                "testers" => Self::Testers,
                "off" => Self::Off,
                "public" => Self::Public,
                other => {
                    tracing::warn!(value = other, "unknown MODE_SWITCH_VISIBILITY, using public");
                    Self::Public
                }
            }
        }

        pub fn allows(self, user_id: i64, testers: &BTreeSet<i64>) -> bool {
            match self {
                Self::Public => true,
                Self::Testers => testers.contains(&user_id),
                Self::Off => false,
            }
        }
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct BotSettings {
        pub api_key: String,
        pub base_url: String,
        pub assistants: AssistantIds,
        pub classifier: ClassifierSettings,
        pub runs: RunSettings,
        pub database_path: Option<PathBuf>,
        #[serde(default)]
        pub debug_mode: bool,
        #[serde(default)]
        pub mode_switch_visibility: ModeSwitchVisibility,
        /// Chat user ids allowed to switch under `ModeSwitchVisibility::Testers`
        #[serde(default)]
        pub mode_switch_users: BTreeSet<i64>,
    }

    impl Default for ClassifierSettings {
        fn default() -> Self {
            Self {
                model: "gpt-4o-mini".into(),
                max_tokens: 120,
                temperature: 0.0,
                timeout_secs: 12,
            }
        }
    }

    impl Default for RunSettings {
        fn default() -> Self {
            Self {
                run_wait_secs: 60,
                guard_slack_secs: 5,
                poll_interval_ms: 1200,
                http_timeout_secs: 30,
                worker_pool_size: 8,
                worker_queue_depth: 32,
            }
        }
    }

    impl RunSettings {
        pub fn run_wait(&self) -> Duration {
            Duration::from_secs(self.run_wait_secs)
        }

        /// Outer deadline, strictly larger than the run wait so the inner
        /// timeout fires first and is classified precisely.
        pub fn guard_deadline(&self) -> Duration {
            Duration::from_secs(self.run_wait_secs + self.guard_slack_secs.max(1))
        }

        pub fn poll_interval(&self) -> Duration {
            Duration::from_millis(self.poll_interval_ms)
        }

        pub fn http_timeout(&self) -> Duration {
            Duration::from_secs(self.http_timeout_secs)
        }
    }

    impl Default for BotSettings {
        fn default() -> Self {
            Self {
                api_key: String::new(),
                base_url: DEFAULT_BASE_URL.into(),
                assistants: AssistantIds {
                    free: String::new(),
                    pro: String::new(),
                },
                classifier: ClassifierSettings::default(),
                runs: RunSettings::default(),
                database_path: None,
                debug_mode: false,
                mode_switch_visibility: ModeSwitchVisibility::default(),
                mode_switch_users: BTreeSet::new(),
            }
        }
    }

    impl BotSettings {
        /// Load settings from environment variables on top of the defaults.
        pub fn from_env() -> Result<Self, SettingsError> {
            Self::from_lookup(|name| env::var(name).ok())
        }

        /// Same as [`BotSettings::from_env`] with an injectable variable source.
        pub fn from_lookup(
            lookup: impl Fn(&str) -> Option<String>,
        ) -> Result<Self, SettingsError> {
            let get = |name: &str| {
                lookup(name)
                    .map(|v| v.trim().to_string())
                    .filter(|v| !v.is_empty())
            };

            let mut settings = Self::default();
            settings.api_key = get("OPENAI_API_KEY").ok_or(SettingsError::Missing("OPENAI_API_KEY"))?;

            let free = get("ASSISTANT_ID_FREE")
                .or_else(|| get("ASSISTANT_ID"))
                .ok_or(SettingsError::Missing("ASSISTANT_ID_FREE"))?;
            let pro = match get("ASSISTANT_ID_PRO") {
                Some(pro) => pro,
                None => {
                    tracing::warn!("ASSISTANT_ID_PRO not set, PRO mode uses the FREE assistant");
                    free.clone()
                }
            };
            settings.assistants = AssistantIds { free, pro };

            if let Some(url) = get("OPENAI_BASE_URL") {
                settings.base_url = url.trim_end_matches('/').to_string();
            }
            if let Some(raw) = get("RUN_WAIT_TIMEOUT_S") {
                settings.runs.run_wait_secs = parse_number("RUN_WAIT_TIMEOUT_S", &raw)?;
            }
            if let Some(raw) = get("VALIDATION_TIMEOUT_S") {
                settings.classifier.timeout_secs = parse_number("VALIDATION_TIMEOUT_S", &raw)?;
            }
            if let Some(raw) = get("POLL_INTERVAL_MS") {
                settings.runs.poll_interval_ms = parse_number("POLL_INTERVAL_MS", &raw)?;
            }
            if let Some(raw) = get("WORKER_POOL_SIZE") {
                settings.runs.worker_pool_size = parse_number("WORKER_POOL_SIZE", &raw)?;
            }
            if let Some(raw) = get("WORKER_QUEUE_DEPTH") {
                settings.runs.worker_queue_depth = parse_number("WORKER_QUEUE_DEPTH", &raw)?;
            }
            settings.database_path = get("DATABASE_PATH").map(PathBuf::from);
            settings.debug_mode = get("DEBUG_MODE").is_some_and(|v| is_truthy(&v));
            if let Some(raw) = get("MODE_SWITCH_VISIBILITY") {
                settings.mode_switch_visibility = ModeSwitchVisibility::parse(&raw);
            }
            if let Some(raw) = get("MODE_SWITCH_USERS") {
                settings.mode_switch_users = parse_user_ids(&raw);
            }

            if settings.runs.worker_pool_size == 0 {
                return Err(SettingsError::Invalid {
                    name: "WORKER_POOL_SIZE",
                    value: "0".into(),
                });
            }
            Ok(settings)
        }

        pub fn assistant_id(&self, mode: Mode) -> &str {
            self.assistants.for_mode(mode)
        }

        pub fn can_switch_mode(&self, user_id: i64) -> bool {
            self.mode_switch_visibility
                .allows(user_id, &self.mode_switch_users)
        }
    }

    /// "1", "true", "yes" or "on", case-insensitive
    pub fn is_truthy(raw: &str) -> bool {
        matches!(
            raw.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        )
    }

    /// Comma-separated ids; blanks and entries that are not integers are skipped.
    fn parse_user_ids(raw: &str) -> BTreeSet<i64> {
        raw.split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .filter_map(|part| match part.parse() {
                Ok(id) => Some(id),
                Err(_) => {
                    tracing::warn!(entry = part, "skipping non-numeric MODE_SWITCH_USERS entry");
                    None
                }
            })
            .collect()
    }

    fn parse_number<T: std::str::FromStr>(name: &'static str, raw: &str) -> Result<T, SettingsError> {
        raw.parse().map_err(|_| SettingsError::Invalid {
            name,
            value: raw.to_string(),
        })
    }

}

pub mod agent_api {
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct ChatMessage {
        pub role: String, // "system" | "user" | "assistant"
        pub content: String,
    }

    impl ChatMessage {
        pub fn system(content: impl Into<String>) -> Self {
            Self {
                role: "system".into(),
                content: content.into(),
            }
        }

        pub fn user(content: impl Into<String>) -> Self {
            Self {
                role: "user".into(),
                content: content.into(),
            }
        }
    }
}
