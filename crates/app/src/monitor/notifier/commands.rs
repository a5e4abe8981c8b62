//! Remote control commands and their authorization.

use std::{
    collections::HashSet,
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use tracing::{info, warn};

use crate::monitor::armed::ArmedState;

pub(crate) const HELP_TEXT: &str = "🦅 Falcon Eye Security System\n\n\
Commands:\n\
/arm - Enable detection alerts\n\
/disarm - Disable alerts (monitoring only)\n\
/status - Show system status";

const UNAUTHORIZED_TEXT: &str = "⛔ Unauthorized access.";
const ARMED_TEXT: &str = "✅ System ARMED. Monitoring for intruders.";
const DISARMED_TEXT: &str = "💤 System DISARMED. Alerts paused.";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommandKind {
    Start,
    Help,
    Arm,
    Disarm,
    Status,
}

impl CommandKind {
    /// Parse `/name`, `/name@BotName` or `/name args`. Anything else is not a
    /// command. A `@BotName` suffix must match `account` (case-insensitive);
    /// commands addressed to another bot are not ours.
    pub fn parse(text: &str, account: Option<&str>) -> Option<Self> {
        let word = text.trim().split_whitespace().next()?;
        let name = word.strip_prefix('/')?;
        let name = match name.split_once('@') {
            Some((name, addressee)) => {
                let account = account?;
                if !addressee.eq_ignore_ascii_case(account.trim_start_matches('@')) {
                    return None;
                }
                name
            }
            None => name,
        };
        match name.to_ascii_lowercase().as_str() {
            "start" => Some(CommandKind::Start),
            "help" => Some(CommandKind::Help),
            "arm" => Some(CommandKind::Arm),
            "disarm" => Some(CommandKind::Disarm),
            "status" => Some(CommandKind::Status),
            _ => None,
        }
    }

    fn mutates(self) -> bool {
        matches!(self, CommandKind::Arm | CommandKind::Disarm)
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CommandKind::Start => "start",
            CommandKind::Help => "help",
            CommandKind::Arm => "arm",
            CommandKind::Disarm => "disarm",
            CommandKind::Status => "status",
        };
        write!(f, "/{name}")
    }
}

/// A message received from the remote side.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InboundCommand {
    pub sender_id: i64,
    pub sender_name: String,
    pub chat_id: i64,
    pub text: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CommandOutcome {
    Help,
    Armed,
    Disarmed,
    Status(String),
    Unauthorized { sender_id: i64, command: CommandKind },
    /// Not a recognised command.
    Ignored,
}

impl CommandOutcome {
    /// Text to send back to the sender, if any.
    pub fn reply(&self) -> Option<String> {
        match self {
            CommandOutcome::Help => Some(HELP_TEXT.to_string()),
            CommandOutcome::Armed => Some(ARMED_TEXT.to_string()),
            CommandOutcome::Disarmed => Some(DISARMED_TEXT.to_string()),
            CommandOutcome::Status(text) => Some(text.clone()),
            CommandOutcome::Unauthorized { .. } => Some(UNAUTHORIZED_TEXT.to_string()),
            CommandOutcome::Ignored => None,
        }
    }
}

/// Produces the `/status` reply.
pub type StatusReporter = Arc<dyn Fn() -> String + Send + Sync>;

/// Checks senders against the allow-list and applies commands to the
/// shared armed flag.
#[derive(Clone)]
pub struct CommandRouter {
    allowed: HashSet<i64>,
    armed: ArmedState,
    status: StatusReporter,
    rejected: Arc<AtomicU64>,
    /// Bot account name, known once the transport has connected.
    account: Option<String>,
}

impl CommandRouter {
    pub fn new(allowed: HashSet<i64>, armed: ArmedState, status: StatusReporter) -> Self {
        if allowed.is_empty() {
            warn!("remote command allow-list is empty; all remote commands will be rejected");
        }
        Self {
            allowed,
            armed,
            status,
            rejected: Arc::new(AtomicU64::new(0)),
            account: None,
        }
    }

    /// Only accept `/cmd@name` suffixes naming `account`.
    pub fn for_account(mut self, account: &str) -> Self {
        self.account = Some(account.to_string());
        self
    }

    /// Commands rejected because the sender is not on the allow-list.
    pub fn rejected_count(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    pub fn is_authorized(&self, sender_id: i64) -> bool {
        self.allowed.contains(&sender_id)
    }

    pub fn handle(&self, command: &InboundCommand) -> CommandOutcome {
        let Some(kind) = CommandKind::parse(&command.text, self.account.as_deref()) else {
            return CommandOutcome::Ignored;
        };

        if !self.is_authorized(command.sender_id) {
            warn!(
                sender = command.sender_id,
                name = %command.sender_name,
                command = %kind,
                "unauthorized remote command rejected"
            );
            self.rejected.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("monitor_unauthorized_commands_total").increment(1);
            return CommandOutcome::Unauthorized {
                sender_id: command.sender_id,
                command: kind,
            };
        }

        if kind.mutates() {
            metrics::counter!("monitor_remote_commands_total", "command" => kind.to_string())
                .increment(1);
        }

        match kind {
            CommandKind::Start | CommandKind::Help => CommandOutcome::Help,
            CommandKind::Arm => {
                self.armed.arm();
                info!(by = %command.sender_name, "system armed remotely");
                CommandOutcome::Armed
            }
            CommandKind::Disarm => {
                self.armed.disarm();
                info!(by = %command.sender_name, "system disarmed remotely");
                CommandOutcome::Disarmed
            }
            CommandKind::Status => CommandOutcome::Status((self.status)()),
        }
    }
}
