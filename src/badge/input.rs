//! Operator input: line-oriented commands read from stdin.
//!
//! Anything that does not start with `/` is a message to broadcast; `//` sends
//! a literal leading slash.

use log::debug;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

use crate::feed::MAX_VIEWPORT_HEIGHT;

pub const HELP_TEXT: &str =
    "/up [n] /down [n] /pgup /pgdn /top /bottom /retry /reconnect /height <n> /quit";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScrollDelta {
    Lines(isize),
    Pages(isize),
    Top,
    Bottom,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperatorInput {
    Scroll(ScrollDelta),
    Submit(String),
    Retry,
    Reconnect,
    Resize(usize),
    Help,
    Quit,
    Unknown(String),
}

/// Interpret one input line; blank lines mean nothing.
pub fn parse_line(line: &str) -> Option<OperatorInput> {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.trim().is_empty() {
        return None;
    }
    if let Some(literal) = line.strip_prefix("//") {
        return Some(OperatorInput::Submit(format!("/{}", literal)));
    }
    let Some(command) = line.strip_prefix('/') else {
        return Some(OperatorInput::Submit(line.to_string()));
    };

    let mut parts = command.split_whitespace();
    let name = parts.next().unwrap_or("").to_ascii_lowercase();
    // counts beyond usize saturate; anything else non-numeric means "1"
    let count = parts.next().and_then(|n| match n.parse::<usize>() {
        Ok(n) => Some(n),
        Err(_) if !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()) => Some(usize::MAX),
        Err(_) => None,
    });
    let lines = count.map_or(1, |n| isize::try_from(n).unwrap_or(isize::MAX));
    let input = match name.as_str() {
        "up" | "u" => OperatorInput::Scroll(ScrollDelta::Lines(lines.saturating_neg())),
        "down" | "d" => OperatorInput::Scroll(ScrollDelta::Lines(lines)),
        "pgup" => OperatorInput::Scroll(ScrollDelta::Pages(-1)),
        "pgdn" => OperatorInput::Scroll(ScrollDelta::Pages(1)),
        "top" => OperatorInput::Scroll(ScrollDelta::Top),
        "bottom" | "end" => OperatorInput::Scroll(ScrollDelta::Bottom),
        "retry" => OperatorInput::Retry,
        "reconnect" => OperatorInput::Reconnect,
        "height" => match count {
            Some(n) if n > 0 && n <= MAX_VIEWPORT_HEIGHT => OperatorInput::Resize(n),
            _ => OperatorInput::Unknown(line.to_string()),
        },
        "help" | "h" | "?" => OperatorInput::Help,
        "quit" | "q" | "exit" => OperatorInput::Quit,
        _ => OperatorInput::Unknown(line.to_string()),
    };
    Some(input)
}

/// Read stdin lines on a background task. The channel closes at EOF.
pub fn spawn_stdin_reader() -> mpsc::Receiver<OperatorInput> {
    let (tx, rx) = mpsc::channel(16);
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if let Some(input) = parse_line(&line) {
                        if tx.send(input).await.is_err() {
                            break;
                        }
                    }
                }
                Ok(None) => {
                    debug!("stdin closed");
                    break;
                }
                Err(e) => {
                    debug!("stdin read error: {}", e);
                    break;
                }
            }
        }
    });
    rx
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_is_a_submission() {
        assert_eq!(parse_line("hello mesh\n"), Some(OperatorInput::Submit("hello mesh".into())));
        assert_eq!(parse_line("   "), None);
    }

    #[test]
    fn double_slash_escapes_commands() {
        assert_eq!(parse_line("//quit"), Some(OperatorInput::Submit("/quit".into())));
    }

    #[test]
    fn scroll_commands_take_counts() {
        assert_eq!(parse_line("/up 5"), Some(OperatorInput::Scroll(ScrollDelta::Lines(-5))));
        assert_eq!(parse_line("/down"), Some(OperatorInput::Scroll(ScrollDelta::Lines(1))));
        assert_eq!(parse_line("/PGUP"), Some(OperatorInput::Scroll(ScrollDelta::Pages(-1))));
    }

    #[test]
    fn oversized_counts_saturate_in_the_right_direction() {
        assert_eq!(
            parse_line("/up 9223372036854775808"),
            Some(OperatorInput::Scroll(ScrollDelta::Lines(-isize::MAX)))
        );
        assert_eq!(
            parse_line("/up 18446744073709551615"),
            Some(OperatorInput::Scroll(ScrollDelta::Lines(-isize::MAX)))
        );
        assert_eq!(
            parse_line("/down 99999999999999999999999"),
            Some(OperatorInput::Scroll(ScrollDelta::Lines(isize::MAX)))
        );
    }

    #[test]
    fn control_commands() {
        assert_eq!(parse_line("/retry"), Some(OperatorInput::Retry));
        assert_eq!(parse_line("/q"), Some(OperatorInput::Quit));
        assert_eq!(parse_line("/height 12"), Some(OperatorInput::Resize(12)));
        assert!(matches!(parse_line("/height 0"), Some(OperatorInput::Unknown(_))));
        assert!(matches!(
            parse_line("/height 99999999999999999999"),
            Some(OperatorInput::Unknown(_))
        ));
        assert!(matches!(parse_line("/frobnicate"), Some(OperatorInput::Unknown(_))));
    }
}
