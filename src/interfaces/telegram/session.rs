//! Per-chat wizard state machine. Pure: every input yields the next step
//! plus one [`Action`] for the transport layer to carry out.

use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::core::deals::{CustomField, EnumChoice, FieldKind, JobParams, TagValues};

/// Telegram rejects longer messages; lists are split below this.
pub const MESSAGE_CHUNK_CHARS: usize = 1800;
pub const PROGRESS_INTERVAL: Duration = Duration::from_millis(1500);

pub const CATEGORY_PREFIX: &str = "cat_";
pub const STAGE_PREFIX: &str = "stage_";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Start,
    Status,
    SetTokens,
    Run,
    Cancel,
}

impl Command {
    /// Accepts `/run` as well as `/run@SomeBot`.
    pub fn parse(text: &str) -> Option<Self> {
        let word = text.trim().split_whitespace().next()?;
        let name = word.strip_prefix('/')?.split('@').next()?;
        match name {
            "start" => Some(Command::Start),
            "status" => Some(Command::Status),
            "set_tokens" => Some(Command::SetTokens),
            "run" => Some(Command::Run),
            "cancel" => Some(Command::Cancel),
            _ => None,
        }
    }
}

/// Category, stage and field picked so far.
#[derive(Debug, Clone, PartialEq)]
pub struct JobDraft {
    pub category_id: String,
    pub stage_id: String,
    pub field: CustomField,
}

#[derive(Debug, Clone, Default)]
pub enum WizardStep {
    #[default]
    Idle,
    TokensDomain,
    TokensAccess {
        domain: String,
    },
    TokensRefresh {
        domain: String,
        access_token: String,
    },
    ChoosingCategory,
    ChoosingStage {
        category_id: String,
    },
    FieldIndex {
        category_id: String,
        stage_id: String,
        fields: Vec<CustomField>,
    },
    EnumMode {
        draft: JobDraft,
    },
    EnumIndex {
        draft: JobDraft,
    },
    StringTemplate {
        draft: JobDraft,
    },
    MaxDeals {
        draft: JobDraft,
        values: TagValues,
    },
    DryRun {
        draft: JobDraft,
        values: TagValues,
        max_deals: Option<usize>,
    },
    Confirm {
        params: JobParams,
    },
    Running {
        cancel: CancellationToken,
    },
}

/// Side effect requested by a transition.
#[derive(Debug, Clone)]
pub enum Action {
    Say(String),
    SayAll(Vec<String>),
    ShowMenu,
    ShowStatus,
    SaveCredentials {
        domain: String,
        access_token: String,
        refresh_token: Option<String>,
    },
    ListCategories,
    ListStages {
        category_id: String,
    },
    LoadFields {
        category_id: String,
        stage_id: String,
    },
    StartJob {
        params: JobParams,
        cancel: CancellationToken,
    },
    Nothing,
}

#[derive(Debug)]
pub struct Transition {
    pub next: WizardStep,
    pub action: Action,
}

impl Transition {
    fn to(next: WizardStep, action: Action) -> Self {
        Self { next, action }
    }

    fn say(next: WizardStep, text: impl Into<String>) -> Self {
        Self::to(next, Action::Say(text.into()))
    }
}

impl WizardStep {
    pub fn is_running(&self) -> bool {
        matches!(self, WizardStep::Running { .. })
    }

    pub fn on_command(self, command: Command) -> Transition {
        match (command, self) {
            (Command::Cancel, WizardStep::Running { cancel }) => {
                cancel.cancel();
                Transition::say(
                    WizardStep::Running { cancel },
                    "Stopping after the current group...",
                )
            }
            (Command::Cancel, _) => Transition::say(WizardStep::Idle, "Cancelled. Send /run to start over."),
            (Command::Status, step) => Transition::to(step, Action::ShowStatus),
            (_, running @ WizardStep::Running { .. }) => Transition::say(
                running,
                "A job is running. Send /cancel to stop it.",
            ),
            (Command::Start, _) => Transition::to(WizardStep::Idle, Action::ShowMenu),
            (Command::SetTokens, _) => Transition::say(
                WizardStep::TokensDomain,
                "Send the portal domain (e.g. yourportal.bitrix24.ru):",
            ),
            (Command::Run, _) => Transition::to(WizardStep::ChoosingCategory, Action::ListCategories),
        }
    }

    /// Free-text reply. Invalid answers re-prompt without leaving the step.
    pub fn on_text(self, text: &str, chunk_size: usize) -> Transition {
        let text = text.trim();
        match self {
            WizardStep::TokensDomain => {
                if text.is_empty() {
                    return Transition::say(WizardStep::TokensDomain, "The domain cannot be empty.");
                }
                Transition::say(
                    WizardStep::TokensAccess {
                        domain: text.to_string(),
                    },
                    "Send the access_token:",
                )
            }
            WizardStep::TokensAccess { domain } => {
                if text.is_empty() {
                    return Transition::say(
                        WizardStep::TokensAccess { domain },
                        "The access_token cannot be empty.",
                    );
                }
                Transition::say(
                    WizardStep::TokensRefresh {
                        domain,
                        access_token: text.to_string(),
                    },
                    "Send the refresh_token, or - if there is none:",
                )
            }
            WizardStep::TokensRefresh {
                domain,
                access_token,
            } => {
                let refresh_token = match text {
                    "" | "-" => None,
                    token => Some(token.to_string()),
                };
                Transition::to(
                    WizardStep::Idle,
                    Action::SaveCredentials {
                        domain,
                        access_token,
                        refresh_token,
                    },
                )
            }
            WizardStep::FieldIndex {
                category_id,
                stage_id,
                fields,
            } => match parse_index(text, fields.len()) {
                Some(i) => {
                    let draft = JobDraft {
                        category_id,
                        stage_id,
                        field: fields[i].clone(),
                    };
                    ask_for_values(draft)
                }
                None => {
                    let prompt = index_prompt("field", fields.len());
                    Transition::say(
                        WizardStep::FieldIndex {
                            category_id,
                            stage_id,
                            fields,
                        },
                        format!("Invalid field index. {}", prompt),
                    )
                }
            },
            WizardStep::EnumMode { draft } => match text {
                "1" => {
                    let choice_ids = draft.field.choices().iter().map(|c| c.id.clone()).collect();
                    ask_for_max(draft, TagValues::Enumeration { choice_ids })
                }
                "2" => {
                    let mut lines = vec!["Values:".to_string()];
                    lines.extend(numbered(draft.field.choices()));
                    let mut messages = split_messages(&lines, MESSAGE_CHUNK_CHARS);
                    messages.push(index_prompt("value", draft.field.choices().len()));
                    Transition::to(WizardStep::EnumIndex { draft }, Action::SayAll(messages))
                }
                _ => Transition::say(WizardStep::EnumMode { draft }, "Send 1 or 2."),
            },
            WizardStep::EnumIndex { draft } => {
                let choices = draft.field.choices();
                match parse_index(text, choices.len()) {
                    Some(i) => {
                        let choice_ids = vec![choices[i].id.clone()];
                        ask_for_max(draft, TagValues::Enumeration { choice_ids })
                    }
                    None => {
                        let prompt = index_prompt("value", choices.len());
                        Transition::say(
                            WizardStep::EnumIndex { draft },
                            format!("Invalid value index. {}", prompt),
                        )
                    }
                }
            }
            WizardStep::StringTemplate { draft } => {
                let template = if text.is_empty() { "{n}" } else { text };
                ask_for_max(
                    draft,
                    TagValues::Text {
                        template: Some(template.to_string()),
                    },
                )
            }
            WizardStep::MaxDeals { draft, values } => match parse_max(text) {
                Ok(max_deals) => Transition::say(
                    WizardStep::DryRun {
                        draft,
                        values,
                        max_deals,
                    },
                    "Dry run? Send yes (default) or no:",
                ),
                Err(()) => Transition::say(
                    WizardStep::MaxDeals { draft, values },
                    "Invalid number. Send a positive number or 'all'.",
                ),
            },
            WizardStep::DryRun {
                draft,
                values,
                max_deals,
            } => {
                let dry_run = text.is_empty() || text.to_lowercase().starts_with('y');
                let mut params = JobParams::new(
                    JobParams::stage_filter(&draft.category_id, &draft.stage_id),
                    &draft.field.name,
                    values,
                );
                params.max_deals = max_deals;
                params.dry_run = dry_run;
                params.chunk_size = chunk_size;
                let summary = describe(&draft, &params);
                Transition::to(
                    WizardStep::Confirm { params },
                    Action::SayAll(vec![summary, "Start the job? yes / no".to_string()]),
                )
            }
            WizardStep::Confirm { params } => {
                if text.to_lowercase().starts_with('y') {
                    let cancel = CancellationToken::new();
                    Transition::to(
                        WizardStep::Running {
                            cancel: cancel.clone(),
                        },
                        Action::StartJob { params, cancel },
                    )
                } else {
                    Transition::say(WizardStep::Idle, "Job cancelled.")
                }
            }
            running @ WizardStep::Running { .. } => {
                Transition::say(running, "A job is running. Send /cancel to stop it.")
            }
            step @ (WizardStep::ChoosingCategory | WizardStep::ChoosingStage { .. }) => {
                Transition::say(step, "Use the buttons above to choose.")
            }
            WizardStep::Idle => Transition::to(WizardStep::Idle, Action::Nothing),
        }
    }

    /// Inline keyboard press (`cat_<id>` / `stage_<status>`).
    pub fn on_callback(self, data: &str) -> Transition {
        match self {
            WizardStep::ChoosingCategory => match data.strip_prefix(CATEGORY_PREFIX) {
                Some(id) if !id.is_empty() => Transition::to(
                    WizardStep::ChoosingStage {
                        category_id: id.to_string(),
                    },
                    Action::ListStages {
                        category_id: id.to_string(),
                    },
                ),
                _ => Transition::say(WizardStep::ChoosingCategory, "Pick a category."),
            },
            WizardStep::ChoosingStage { category_id } => match data.strip_prefix(STAGE_PREFIX) {
                Some(stage) if !stage.is_empty() => {
                    let stage_id = stage.to_string();
                    Transition::to(
                        WizardStep::ChoosingStage {
                            category_id: category_id.clone(),
                        },
                        Action::LoadFields {
                            category_id,
                            stage_id,
                        },
                    )
                }
                _ => Transition::say(WizardStep::ChoosingStage { category_id }, "Pick a stage."),
            },
            step => Transition::say(step, "This button is no longer active. Send /run to start over."),
        }
    }

    /// The field list arrived for the chosen stage.
    pub fn fields_loaded(category_id: String, stage_id: String, fields: Vec<CustomField>) -> Transition {
        if fields.is_empty() {
            return Transition::say(
                WizardStep::Idle,
                "No supported fields found (single-valued string or enumeration only).",
            );
        }
        let lines: Vec<String> = fields
            .iter()
            .enumerate()
            .map(|(i, f)| format!("{}: {}", i, f))
            .collect();
        let mut messages = split_messages(&lines, MESSAGE_CHUNK_CHARS);
        messages.push(index_prompt("field", fields.len()));
        Transition::to(
            WizardStep::FieldIndex {
                category_id,
                stage_id,
                fields,
            },
            Action::SayAll(messages),
        )
    }
}

fn ask_for_values(draft: JobDraft) -> Transition {
    match &draft.field.kind {
        FieldKind::Enumeration { choices } if choices.is_empty() => Transition::say(
            WizardStep::Idle,
            "This enumeration field has no values. Send /run and pick another field.",
        ),
        FieldKind::Enumeration { .. } => Transition::say(
            WizardStep::EnumMode { draft },
            "Enumeration field selected. Choose a mode:\n1 - cycle through all values, one per group\n2 - one value for every group\nSend 1 or 2.",
        ),
        FieldKind::Text => Transition::say(
            WizardStep::StringTemplate { draft },
            "Send the value template ({n} becomes the group number), e.g. 'Group {n}' or just '{n}':",
        ),
    }
}

fn ask_for_max(draft: JobDraft, values: TagValues) -> Transition {
    Transition::say(
        WizardStep::MaxDeals { draft, values },
        "Maximum number of deals to process (a number, or 'all'):",
    )
}

fn describe(draft: &JobDraft, params: &JobParams) -> String {
    [
        "Summary:".to_string(),
        format!("Category: {}", draft.category_id),
        format!("Stage: {}", draft.stage_id),
        format!("Field: {}", draft.field),
        format!("Values: {}", params.values),
        format!(
            "Max deals: {}",
            params
                .max_deals
                .map_or_else(|| "all".to_string(), |n| n.to_string())
        ),
        format!("Group size: {}", params.chunk_size),
        format!("Dry run: {}", if params.dry_run { "yes" } else { "no" }),
    ]
    .join("\n")
}

fn numbered(choices: &[EnumChoice]) -> Vec<String> {
    choices
        .iter()
        .enumerate()
        .map(|(i, c)| format!("{}: {}", i, c))
        .collect()
}

fn index_prompt(what: &str, len: usize) -> String {
    format!("Send the {} index (0..{}):", what, len.saturating_sub(1))
}

fn parse_index(text: &str, len: usize) -> Option<usize> {
    text.parse::<usize>().ok().filter(|i| *i < len)
}

/// `all` means no limit; otherwise a positive number.
fn parse_max(text: &str) -> Result<Option<usize>, ()> {
    if text.is_empty() || text.eq_ignore_ascii_case("all") {
        return Ok(None);
    }
    match text.parse::<usize>() {
        Ok(0) | Err(_) => Err(()),
        Ok(n) => Ok(Some(n)),
    }
}

/// Join lines into messages of at most `limit` characters.
pub fn split_messages(lines: &[String], limit: usize) -> Vec<String> {
    let mut messages = Vec::new();
    let mut buf = String::new();
    for line in lines {
        if !buf.is_empty() && buf.chars().count() + line.chars().count() + 1 > limit {
            messages.push(std::mem::take(&mut buf));
        }
        buf.push_str(line);
        buf.push('\n');
    }
    if !buf.is_empty() {
        messages.push(buf);
    }
    messages
}

/// Lets progress through at most once per interval.
pub struct ProgressThrottle {
    interval: Duration,
    last: Option<Instant>,
}

impl ProgressThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
        }
    }

    pub fn should_emit(&mut self, now: Instant) -> bool {
        match self.last {
            Some(last) if now.duration_since(last) < self.interval => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn enum_field() -> CustomField {
        CustomField {
            name: "UF_CRM_GROUP".into(),
            label: Some("Group".into()),
            kind: FieldKind::Enumeration {
                choices: vec![
                    EnumChoice { id: "11".into(), value: "A".into() },
                    EnumChoice { id: "22".into(), value: "B".into() },
                ],
            },
            multiple: false,
        }
    }

    fn text_field() -> CustomField {
        CustomField {
            name: "UF_CRM_NOTE".into(),
            label: None,
            kind: FieldKind::Text,
            multiple: false,
        }
    }

    fn field_step() -> WizardStep {
        WizardStep::FieldIndex {
            category_id: "4".into(),
            stage_id: "C4:NEW".into(),
            fields: vec![enum_field(), text_field()],
        }
    }

    fn drive(mut step: WizardStep, inputs: &[&str]) -> Transition {
        let mut last = None;
        for input in inputs {
            let t = step.on_text(input, 150);
            step = t.next.clone();
            last = Some(t);
        }
        last.unwrap()
    }

    #[test]
    fn commands_parse_with_bot_suffix() {
        assert_eq!(Command::parse("/run"), Some(Command::Run));
        assert_eq!(Command::parse("/set_tokens@DealBot"), Some(Command::SetTokens));
        assert_eq!(Command::parse("/unknown"), None);
        assert_eq!(Command::parse("run"), None);
    }

    #[test]
    fn token_flow_collects_three_answers() {
        let t = drive(WizardStep::Idle.on_command(Command::SetTokens).next, &[
            "portal.example.com",
            "acc",
            "-",
        ]);
        assert!(matches!(t.next, WizardStep::Idle));
        match t.action {
            Action::SaveCredentials {
                domain,
                access_token,
                refresh_token,
            } => {
                assert_eq!(domain, "portal.example.com");
                assert_eq!(access_token, "acc");
                assert_eq!(refresh_token, None);
            }
            other => panic!("unexpected action {:?}", other),
        }
    }

    #[test]
    fn buttons_lead_to_field_loading() {
        let t = WizardStep::Idle.on_command(Command::Run);
        assert!(matches!(t.action, Action::ListCategories));
        let t = t.next.on_callback("cat_4");
        assert!(matches!(&t.action, Action::ListStages { category_id } if category_id == "4"));
        let t = t.next.on_callback("stage_C4:NEW");
        match t.action {
            Action::LoadFields {
                category_id,
                stage_id,
            } => {
                assert_eq!(category_id, "4");
                assert_eq!(stage_id, "C4:NEW");
            }
            other => panic!("unexpected action {:?}", other),
        }
    }

    #[test]
    fn stale_button_is_ignored() {
        let t = WizardStep::Idle.on_callback("cat_1");
        assert!(matches!(t.next, WizardStep::Idle));
        assert!(matches!(t.action, Action::Say(_)));
    }

    #[test]
    fn invalid_field_index_reprompts_in_place() {
        let t = field_step().on_text("7", 150);
        assert!(matches!(t.next, WizardStep::FieldIndex { .. }));
        let t = t.next.on_text("abc", 150);
        assert!(matches!(t.next, WizardStep::FieldIndex { .. }));
    }

    #[test]
    fn cycle_mode_builds_enumeration_job() {
        let t = drive(field_step(), &["0", "1", "all", "no"]);
        let WizardStep::Confirm { params } = &t.next else {
            panic!("expected confirm, got {:?}", t.next);
        };
        assert_eq!(
            params.values,
            TagValues::Enumeration {
                choice_ids: vec!["11".into(), "22".into()]
            }
        );
        assert_eq!(params.max_deals, None);
        assert!(!params.dry_run);
        assert_eq!(params.chunk_size, 150);
        assert_eq!(params.filter["STAGE_ID"], "C4:NEW");

        let t = t.next.on_text("yes", 150);
        assert!(t.next.is_running());
        assert!(matches!(t.action, Action::StartJob { .. }));
    }

    #[test]
    fn single_mode_picks_one_choice() {
        let t = drive(field_step(), &["0", "2", "9", "1", "500", ""]);
        let WizardStep::Confirm { params } = &t.next else {
            panic!("expected confirm");
        };
        assert_eq!(
            params.values,
            TagValues::Enumeration {
                choice_ids: vec!["22".into()]
            }
        );
        assert_eq!(params.max_deals, Some(500));
        assert!(params.dry_run);
    }

    #[test]
    fn string_field_uses_template() {
        let t = drive(field_step(), &["1", "Batch {n}", "0"]);
        assert!(matches!(t.next, WizardStep::MaxDeals { .. }));
        let t = t.next.on_text("20", 150).next.on_text("y", 150);
        let WizardStep::Confirm { params } = t.next else {
            panic!("expected confirm");
        };
        assert_eq!(
            params.values,
            TagValues::Text {
                template: Some("Batch {n}".into())
            }
        );
    }

    #[test]
    fn declining_confirmation_returns_to_idle() {
        let t = drive(field_step(), &["1", "{n}", "all", "yes", "no"]);
        assert!(matches!(t.next, WizardStep::Idle));
    }

    #[test]
    fn cancel_while_running_trips_the_token() {
        let cancel = CancellationToken::new();
        let t = WizardStep::Running {
            cancel: cancel.clone(),
        }
        .on_command(Command::Cancel);
        assert!(cancel.is_cancelled());
        assert!(t.next.is_running());

        let t = field_step().on_command(Command::Cancel);
        assert!(matches!(t.next, WizardStep::Idle));
    }

    #[test]
    fn run_is_refused_while_a_job_runs() {
        let t = WizardStep::Running {
            cancel: CancellationToken::new(),
        }
        .on_command(Command::Run);
        assert!(t.next.is_running());
        assert!(matches!(t.action, Action::Say(_)));
    }

    #[test]
    fn empty_field_list_ends_the_wizard() {
        let t = WizardStep::fields_loaded("0".into(), "NEW".into(), Vec::new());
        assert!(matches!(t.next, WizardStep::Idle));
    }

    #[test]
    fn long_lists_are_split_under_the_limit() {
        let lines: Vec<String> = (0..200).map(|i| format!("{}: UF_CRM_FIELD_{:03}", i, i)).collect();
        let messages = split_messages(&lines, MESSAGE_CHUNK_CHARS);
        assert!(messages.len() > 1);
        assert!(messages.iter().all(|m| m.chars().count() <= MESSAGE_CHUNK_CHARS));
        assert_eq!(messages.concat().lines().count(), 200);
    }

    #[test]
    fn throttle_allows_one_event_per_interval() {
        let mut throttle = ProgressThrottle::new(PROGRESS_INTERVAL);
        let start = Instant::now();
        assert!(throttle.should_emit(start));
        assert!(!throttle.should_emit(start + Duration::from_millis(1000)));
        assert!(throttle.should_emit(start + Duration::from_millis(1600)));
    }
}
