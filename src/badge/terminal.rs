//! Framed text-screen renderer for a small terminal.
//!
//! ```text
//! ╔══════════════════════════════════════╗
//! ║ Retro-Badge · Meshtastic  [● LINK]   ║
//! ╠══════════════════════════════════════╣
//! ║ 14:02  !a1b2c3d4 │ hello             ║
//! ║ 14:03        You │ hi back           ║
//! ╚══════════════════════════════════════╝
//!  connected · 2/2                 /help
//! ```

use std::io::{self, Write};

use crate::feed::MAX_VIEWPORT_HEIGHT;
use crate::message::{DeliveryState, Message};
use crate::supervisor::{LinkState, SessionStatus};

const TITLE: &str = "Retro-Badge · Meshtastic";
const SENDER_WIDTH: usize = 10;

/// Everything one screen needs.
pub struct Frame<'a> {
    pub status: &'a SessionStatus,
    pub window: &'a [Message],
    pub notice: Option<&'a str>,
    /// Index of the first visible message in the whole feed.
    pub first: usize,
    pub total: usize,
    pub at_bottom: bool,
}

pub trait Render {
    fn draw(&mut self, frame: &Frame<'_>) -> io::Result<()>;

    fn set_viewport_height(&mut self, height: usize);
}

pub struct TerminalRenderer<W: Write> {
    out: W,
    width: usize,
    viewport_height: usize,
    clear_screen: bool,
}

impl<W: Write> TerminalRenderer<W> {
    pub fn new(out: W, width: usize, viewport_height: usize) -> Self {
        Self {
            out,
            width: width.max(24),
            viewport_height: viewport_height.clamp(1, MAX_VIEWPORT_HEIGHT),
            clear_screen: true,
        }
    }

    /// Plain output without ANSI clear codes (pipes, tests).
    pub fn without_clear(mut self) -> Self {
        self.clear_screen = false;
        self
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn inner_width(&self) -> usize {
        self.width - 2
    }
}

impl<W: Write> Render for TerminalRenderer<W> {
    fn draw(&mut self, frame: &Frame<'_>) -> io::Result<()> {
        let inner = self.inner_width();
        let mut screen = String::new();
        if self.clear_screen {
            screen.push_str("\x1b[2J\x1b[H");
        }

        let link = if frame.status.state == LinkState::Connected {
            "[● LINK]"
        } else {
            "[○ NO LINK]"
        };
        screen.push_str(&format!("╔{}╗\n", "═".repeat(inner)));
        screen.push_str(&format!("║{}║\n", fit(&format!(" {}  {}", TITLE, link), inner)));
        screen.push_str(&format!("╠{}╣\n", "═".repeat(inner)));

        for m in frame.window {
            screen.push_str(&format!("║{}║\n", fit(&message_line(m), inner)));
        }
        for _ in frame.window.len()..self.viewport_height {
            screen.push_str(&format!("║{}║\n", " ".repeat(inner)));
        }

        screen.push_str(&format!("╚{}╝\n", "═".repeat(inner)));
        screen.push_str(&status_line(frame, self.width));
        screen.push('\n');

        self.out.write_all(screen.as_bytes())?;
        self.out.flush()
    }

    fn set_viewport_height(&mut self, height: usize) {
        self.viewport_height = height.clamp(1, MAX_VIEWPORT_HEIGHT);
    }
}

/// `HH:MM  sender │ body`, with a marker on failed sends.
pub fn message_line(m: &Message) -> String {
    let sender: String = m.sender.chars().take(SENDER_WIDTH).collect();
    let marker = match m.delivery_state {
        DeliveryState::SendFailed => "✗ ",
        _ => "",
    };
    format!(
        " {} {:>width$} │ {}{}",
        m.timestamp.format("%H:%M"),
        sender,
        marker,
        m.body,
        width = SENDER_WIDTH
    )
}

fn status_line(frame: &Frame<'_>, width: usize) -> String {
    let mut left = format!(" {}", frame.status.state.label());
    if let Some(exhausted) = &frame.status.exhausted {
        left = format!(" offline ({} attempts, /reconnect)", exhausted.attempts);
    } else if frame.status.state != LinkState::Connected && frame.status.attempt_count > 0 {
        left.push_str(&format!(" (attempt {})", frame.status.attempt_count + 1));
    }
    let last = (frame.first + frame.window.len()).min(frame.total);
    left.push_str(&format!(" · {}/{}", last, frame.total));
    if !frame.at_bottom {
        left.push_str(" ↓");
    }
    if let Some(notice) = frame.notice {
        left.push_str(" · ");
        left.push_str(notice);
    }
    let right = "/help";
    let left_len = left.chars().count();
    if left_len + right.len() + 1 <= width {
        format!("{}{}{}", left, " ".repeat(width - left_len - right.len()), right)
    } else {
        fit(&left, width)
    }
}

/// Pad or cut to exactly `width` characters.
fn fit(s: &str, width: usize) -> String {
    let count = s.chars().count();
    if count > width {
        let mut cut: String = s.chars().take(width.saturating_sub(1)).collect();
        cut.push('…');
        cut
    } else {
        format!("{}{}", s, " ".repeat(width - count))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn msg(sender: &str, body: &str) -> Message {
        Message::inbound(
            "id".into(),
            Utc.with_ymd_and_hms(2024, 5, 1, 14, 2, 0).unwrap(),
            sender.into(),
            body.into(),
        )
    }

    #[test]
    fn message_lines_show_time_sender_and_body() {
        let line = message_line(&msg("!a1b2c3d4", "hello"));
        assert_eq!(line, " 14:02  !a1b2c3d4 │ hello");
    }

    #[test]
    fn failed_sends_are_marked() {
        let mut m = msg("You", "ping");
        m.delivery_state = DeliveryState::SendFailed;
        assert!(message_line(&m).contains("✗ ping"));
    }

    #[test]
    fn frame_is_boxed_to_width_and_padded_to_height() {
        let status = SessionStatus::default();
        let window = vec![msg("!00000001", &"x".repeat(100))];
        let frame = Frame {
            status: &status,
            window: &window,
            notice: Some("Not connected"),
            first: 0,
            total: 1,
            at_bottom: true,
        };
        let mut r = TerminalRenderer::new(Vec::new(), 40, 3).without_clear();
        r.draw(&frame).unwrap();
        let text = String::from_utf8(r.into_inner()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        // top, header, divider, 3 rows, bottom, status
        assert_eq!(lines.len(), 8);
        assert!(lines[..7].iter().all(|l| l.chars().count() == 40));
        assert!(lines[1].contains("[○ NO LINK]"));
        assert!(lines[3].ends_with("…║"));
        assert!(lines[7].contains("offline"));
        assert!(lines[7].contains("Not connected"));
    }
}
