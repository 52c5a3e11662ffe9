//! User-facing canned texts and the classifier instruction.
//!
//! The bot talks to its users in Russian, so every string shown to them
//! lives here rather than inline in the flow code.

use chrono::NaiveDate;

/// Backend down, network failure or anything unclassified
pub const MSG_SERVICE_UNAVAILABLE: &str =
    "⚠️ Сервис временно недоступен. Пожалуйста, попробуйте чуть позже.";

/// Run is still being processed on the backend
pub const MSG_RUN_TIMEOUT: &str =
    "⏳ Ответ ещё готовится. Повторите запрос через минуту, он не потеряется.";

/// Mode switching is turned off for this user
pub const MSG_MODE_SWITCH_UNAVAILABLE: &str = "Переключение режима сейчас недоступно.";

/// Heuristic gate rejected the input
pub const HEURISTIC_FAIL_MESSAGE: &str = "Пожалуйста, укажите конкретное действие. \
     Например: подписать договор, поговорить с руководителем, купить билет.";

/// Classifier unreachable or answered with garbage
pub const PARSE_ERROR_FALLBACK: &str =
    "Пожалуйста, сформулируйте конкретное действие для проверки.";

/// Substituted when a one- or two-word action arrives without a question
pub const SHORT_ACTION_QUESTION: &str =
    "Уточните, пожалуйста: куда, с кем или зачем? (например: в отпуск, с руководителем)";

/// Second clarification would be needed; the flow gives up instead
pub const MSG_TOO_GENERAL: &str = "Действие всё ещё слишком общее. \
     Опишите его одним предложением: что именно, с кем и когда вы собираетесь сделать.";

pub const VALIDATION_SYSTEM_PROMPT: &str = r#"Ты классифицируешь пользовательские намерения.

Определи, описывает ли текст проверяемое действие: конкретное намерение что-то
сделать в реальности (подписать договор, купить билет, сменить работу).

Не являются действием: эмоции, абстрактные темы, философские вопросы,
просьбы о прогнозе без действия, бессмысленный текст.

Ответь ТОЛЬКО объектом JSON:
{"is_action": boolean, "action_clean": string, "needs_details": boolean, "question_to_user": string}

- action_clean: краткая очищенная формулировка действия.
- needs_details: true, если действие есть, но слишком размыто.
- question_to_user: один короткий вопрос, если needs_details=true или is_action=false."#;

pub fn validation_user_prompt(user_text: &str) -> String {
    format!("Текст пользователя:\n\"{}\"", user_text)
}

/// Prefix every backend message with today's date so the assistant does not guess it.
pub fn date_stamped(today: NaiveDate, message: &str) -> String {
    format!("Сегодня {}. {}", today.format("%d.%m.%Y"), message)
}

pub fn action_check_request(action: &str) -> String {
    format!(
        "Проверь действие пользователя и оцени, благоприятно ли время для него: {}",
        action
    )
}
