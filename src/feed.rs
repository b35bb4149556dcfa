//! Scrollable feed model, independent of how it is drawn.
//!
//! The feed holds every message of the run in display order and a scroll
//! offset into it. The offset always stays within
//! `[0, max(0, len - viewport_height)]`; when the view sits at the bottom,
//! new messages keep it there.

use crate::message::{DeliveryState, Message};

/// Tallest viewport accepted from config or `/height`.
pub const MAX_VIEWPORT_HEIGHT: usize = 500;

#[derive(Debug, Clone)]
pub struct Feed {
    messages: Vec<Message>,
    scroll_offset: usize,
    viewport_height: usize,
}

impl Feed {
    pub fn new(viewport_height: usize) -> Self {
        Self {
            messages: Vec::new(),
            scroll_offset: 0,
            viewport_height: viewport_height.clamp(1, MAX_VIEWPORT_HEIGHT),
        }
    }

    /// Replace the contents with startup history and jump to the newest entry.
    pub fn hydrate(&mut self, history: Vec<Message>) {
        self.messages = history;
        self.scroll_to_bottom();
    }

    pub fn on_message(&mut self, message: Message) {
        let follow = self.at_bottom();
        self.messages.push(message);
        if follow {
            self.scroll_to_bottom();
        }
    }

    /// Move by `delta` lines (negative = towards older messages).
    pub fn scroll(&mut self, delta: isize) {
        let target = (self.scroll_offset as isize).saturating_add(delta);
        self.scroll_offset = target.clamp(0, self.max_offset() as isize) as usize;
    }

    pub fn scroll_page(&mut self, pages: isize) {
        let page = isize::try_from(self.viewport_height).unwrap_or(isize::MAX);
        self.scroll(pages.saturating_mul(page));
    }

    pub fn scroll_to_top(&mut self) {
        self.scroll_offset = 0;
    }

    pub fn scroll_to_bottom(&mut self) {
        self.scroll_offset = self.max_offset();
    }

    /// Change the viewport height, keeping a bottom-anchored view anchored.
    pub fn resize(&mut self, viewport_height: usize) {
        let follow = self.at_bottom();
        self.viewport_height = viewport_height.clamp(1, MAX_VIEWPORT_HEIGHT);
        if follow {
            self.scroll_to_bottom();
        } else {
            self.scroll_offset = self.scroll_offset.min(self.max_offset());
        }
    }

    pub fn visible_window(&self) -> &[Message] {
        let end = self
            .scroll_offset
            .saturating_add(self.viewport_height)
            .min(self.messages.len());
        &self.messages[self.scroll_offset.min(end)..end]
    }

    /// Correct a message in place. Returns false if it is not in the feed.
    pub fn update_delivery(&mut self, id: &str, state: DeliveryState) -> bool {
        match self.messages.iter_mut().rev().find(|m| m.id == id) {
            Some(m) => {
                m.delivery_state = state;
                true
            }
            None => false,
        }
    }

    /// Most recent outbound message whose send failed.
    pub fn last_failed_outbound(&self) -> Option<&Message> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.is_outbound() && m.delivery_state == DeliveryState::SendFailed)
    }

    pub fn at_bottom(&self) -> bool {
        self.scroll_offset >= self.max_offset()
    }

    pub fn max_offset(&self) -> usize {
        self.messages.len().saturating_sub(self.viewport_height)
    }

    pub fn scroll_offset(&self) -> usize {
        self.scroll_offset
    }

    pub fn viewport_height(&self) -> usize {
        self.viewport_height
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn msg(i: usize) -> Message {
        Message::inbound(format!("m{}", i), Utc::now(), "!00000001".into(), format!("#{}", i))
    }

    fn feed_with(n: usize, height: usize) -> Feed {
        let mut f = Feed::new(height);
        f.hydrate((0..n).map(msg).collect());
        f
    }

    fn window_ids(f: &Feed) -> Vec<String> {
        f.visible_window().iter().map(|m| m.id.clone()).collect()
    }

    #[test]
    fn short_feed_shows_everything() {
        let f = feed_with(3, 10);
        assert_eq!(f.scroll_offset(), 0);
        assert_eq!(f.visible_window().len(), 3);
    }

    #[test]
    fn scroll_is_clamped_both_ways() {
        let mut f = feed_with(10, 4);
        assert_eq!(f.scroll_offset(), 6);
        f.scroll(100);
        assert_eq!(f.scroll_offset(), 6);
        f.scroll(-100);
        assert_eq!(f.scroll_offset(), 0);
        f.scroll_page(1);
        assert_eq!(f.scroll_offset(), 4);
        f.scroll_page(5);
        assert_eq!(f.scroll_offset(), 6);
    }

    #[test]
    fn offset_stays_in_range_for_any_scroll_sequence() {
        let mut f = feed_with(7, 3);
        for delta in [-2, 5, -9, 1, 1, 1, 1, 1, -1, 40, -40, 3] {
            f.scroll(delta);
            assert!(f.scroll_offset() <= f.max_offset());
            assert!(f.visible_window().len() <= 3);
        }
    }

    #[test]
    fn extreme_deltas_clamp_instead_of_overflowing() {
        let mut f = feed_with(5, 2);
        f.scroll(-1);
        assert_eq!(f.scroll_offset(), 2);
        f.scroll(isize::MAX);
        assert_eq!(f.scroll_offset(), 3);
        f.scroll(-1);
        f.scroll(isize::MIN);
        assert_eq!(f.scroll_offset(), 0);
        f.scroll_page(isize::MAX);
        assert!(f.at_bottom());
    }

    #[test]
    fn sticky_bottom_follows_new_messages() {
        let mut f = feed_with(5, 3);
        f.on_message(msg(5));
        assert_eq!(window_ids(&f), vec!["m3", "m4", "m5"]);
    }

    #[test]
    fn scrolled_up_view_stays_put() {
        let mut f = feed_with(5, 3);
        f.scroll(-2);
        let before = window_ids(&f);
        f.on_message(msg(5));
        assert_eq!(window_ids(&f), before);
        assert!(!f.at_bottom());
    }

    #[test]
    fn resize_keeps_bottom_anchor() {
        let mut f = feed_with(10, 4);
        f.resize(2);
        assert_eq!(window_ids(&f), vec!["m8", "m9"]);
        f.scroll_to_top();
        f.resize(20);
        assert_eq!(f.scroll_offset(), 0);
        assert_eq!(f.visible_window().len(), 10);
    }

    #[test]
    fn delivery_corrections_apply_in_place() {
        let mut f = Feed::new(5);
        let out = Message::outbound(Utc::now(), "You".into(), "ping".into());
        f.on_message(out.clone());
        assert!(f.update_delivery(&out.id, DeliveryState::SendFailed));
        assert_eq!(f.last_failed_outbound().map(|m| m.id.as_str()), Some(out.id.as_str()));
        assert!(!f.update_delivery("missing", DeliveryState::Sent));
        assert_eq!(f.len(), 1);
    }
}
