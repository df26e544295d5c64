//! Shared conversation rendering for terminal output.
//! Used by `medvoice history` and `medvoice follow`.

use crate::session::log::{ConversationEvent, EventKind};

const DIM: &str = "\x1b[2m";
const BOLD: &str = "\x1b[1m";
const GREEN: &str = "\x1b[32m";
const YELLOW: &str = "\x1b[33m";
const CYAN: &str = "\x1b[36m";
const RED: &str = "\x1b[31m";
const RESET: &str = "\x1b[0m";

/// Speaker label shown in front of an entry.
fn speaker(event: &ConversationEvent) -> String {
    match event.kind {
        EventKind::UserUtterance => "you".to_string(),
        EventKind::AgentReply => event.agent.to_string(),
        EventKind::SystemNotice => "system".to_string(),
        EventKind::TransferNotice => "transfer".to_string(),
        EventKind::ErrorNotice => "error".to_string(),
    }
}

fn kind_color(kind: EventKind) -> &'static str {
    match kind {
        EventKind::UserUtterance => BOLD,
        EventKind::AgentReply => GREEN,
        EventKind::SystemNotice => DIM,
        EventKind::TransferNotice => CYAN,
        EventKind::ErrorNotice => RED,
    }
}

/// Format one conversation entry as a single terminal line.
///
/// `[  12] 14:03:07 triage    How can I help?`
pub fn format_event(event: &ConversationEvent, color: bool) -> String {
    let time = event.timestamp.format("%H:%M:%S");
    let who = speaker(event);
    if color {
        let tint = kind_color(event.kind);
        format!(
            "{DIM}[{:>4}] {time}{RESET} {tint}{who:<9}{RESET} {}",
            event.id, event.text
        )
    } else {
        format!("[{:>4}] {time} {who:<9} {}", event.id, event.text)
    }
}

/// Render a conversation entry to stdout.
pub fn render_event(event: &ConversationEvent, color: bool) {
    println!("{}", format_event(event, color));
}

/// Render a warning line to stderr.
pub fn render_warning(message: &str, color: bool) {
    if color {
        eprintln!("{YELLOW}{message}{RESET}");
    } else {
        eprintln!("{message}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::Agent;
    use chrono::{TimeZone, Utc};

    fn event(kind: EventKind, text: &str) -> ConversationEvent {
        ConversationEvent {
            id: 12,
            kind,
            text: text.to_string(),
            timestamp: Utc.with_ymd_and_hms(2026, 3, 4, 14, 3, 7).unwrap(),
            agent: Agent::Triage,
        }
    }

    #[test]
    fn test_plain_agent_reply() {
        let line = format_event(&event(EventKind::AgentReply, "How can I help?"), false);
        assert_eq!(line, "[  12] 14:03:07 triage    How can I help?");
    }

    #[test]
    fn test_plain_speaker_labels() {
        let cases = [
            (EventKind::UserUtterance, "you"),
            (EventKind::SystemNotice, "system"),
            (EventKind::TransferNotice, "transfer"),
            (EventKind::ErrorNotice, "error"),
        ];
        for (kind, label) in cases {
            let line = format_event(&event(kind, "x"), false);
            assert!(
                line.contains(&format!(" {label:<9} x")),
                "missing label {label} in {line}"
            );
        }
    }

    #[test]
    fn test_colored_error_uses_red() {
        let line = format_event(&event(EventKind::ErrorNotice, "Connection lost"), true);
        assert!(line.contains(RED));
        assert!(line.contains("Connection lost"));
        assert!(line.ends_with("Connection lost"));
    }

    #[test]
    fn test_plain_output_has_no_escape_codes() {
        let line = format_event(&event(EventKind::TransferNotice, "Transferred"), false);
        assert!(!line.contains('\x1b'));
    }

    #[test]
    fn test_render_doesnt_panic() {
        render_event(&event(EventKind::UserUtterance, "hello"), true);
        render_warning("lagging", false);
    }
}
