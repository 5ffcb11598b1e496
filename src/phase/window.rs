//! The accumulated conversation of one phase attempt.
//!
//! `MessageWindow` owns the growable message sequence the provider sees and
//! is where token budget enforcement lives: estimate, then prune with the
//! configured strategy until the upcoming call fits under the limit.

use crate::cascade::TokenBudgetConfig;
use crate::provider::{estimate_tokens, ChatMessage, MessageRole};

/// Flat per-message overhead added to the content estimate, covering role
/// markers and separators.
const MESSAGE_OVERHEAD_TOKENS: u64 = 4;

/// Outcome of one budget enforcement pass.
#[derive(Debug, Clone, Copy)]
pub struct PruneReport {
    pub before: u64,
    pub after: u64,
    pub pruned: usize,
}

#[derive(Debug, Default)]
pub struct MessageWindow {
    messages: Vec<ChatMessage>,
}

impl MessageWindow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, message: ChatMessage) {
        self.messages.push(message);
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn last_assistant_text(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == MessageRole::Assistant && !m.content.is_empty())
            .map(|m| m.content.as_str())
    }

    /// Pre-call input estimate for the whole window.
    pub fn estimated_tokens(&self) -> u64 {
        self.messages
            .iter()
            .map(|m| estimate_tokens(&m.content) + MESSAGE_OVERHEAD_TOKENS)
            .sum()
    }

    /// Whether the next call would exceed the budget.
    pub fn needs_pruning(&self, budget: &TokenBudgetConfig) -> bool {
        self.estimated_tokens() + budget.reserve > budget.limit
    }

    fn target(budget: &TokenBudgetConfig) -> u64 {
        budget.limit.saturating_sub(budget.reserve)
    }

    /// Drop oldest non-system messages until the estimate fits.
    pub fn prune_fifo(&mut self, budget: &TokenBudgetConfig) -> PruneReport {
        let before = self.estimated_tokens();
        let mut pruned = 0;
        while self.estimated_tokens() > Self::target(budget) {
            let Some(index) = self.messages.iter().position(|m| m.role != MessageRole::System)
            else {
                break;
            };
            self.messages.remove(index);
            pruned += 1;
        }
        PruneReport {
            before,
            after: self.estimated_tokens(),
            pruned,
        }
    }

    /// Keep system messages plus the last `keep_last` others.
    pub fn prune_compact(&mut self, budget: &TokenBudgetConfig) -> PruneReport {
        let before = self.estimated_tokens();
        let non_system: Vec<usize> = self
            .messages
            .iter()
            .enumerate()
            .filter(|(_, m)| m.role != MessageRole::System)
            .map(|(i, _)| i)
            .collect();
        let drop_count = non_system.len().saturating_sub(budget.keep_last);
        for &index in non_system[..drop_count].iter().rev() {
            self.messages.remove(index);
        }
        PruneReport {
            before,
            after: self.estimated_tokens(),
            pruned: drop_count,
        }
    }

    /// Remove the oldest non-system messages, leaving `keep_last` recent
    /// ones in place, and hand them back for summarization. The caller
    /// inserts the produced summary with [`insert_summary`].
    ///
    /// [`insert_summary`]: MessageWindow::insert_summary
    pub fn take_summarizable(&mut self, keep_last: usize) -> Vec<ChatMessage> {
        let non_system: Vec<usize> = self
            .messages
            .iter()
            .enumerate()
            .filter(|(_, m)| m.role != MessageRole::System)
            .map(|(i, _)| i)
            .collect();
        let take_count = non_system.len().saturating_sub(keep_last);
        let mut taken = Vec::with_capacity(take_count);
        for &index in non_system[..take_count].iter().rev() {
            taken.push(self.messages.remove(index));
        }
        taken.reverse();
        taken
    }

    /// Insert a summary of removed history right after the system prompt.
    pub fn insert_summary(&mut self, summary: impl Into<String>) {
        let position = self
            .messages
            .iter()
            .position(|m| m.role != MessageRole::System)
            .unwrap_or(self.messages.len());
        self.messages.insert(
            position,
            ChatMessage::user(format!("[Summary of earlier conversation]\n{}", summary.into())),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cascade::BudgetStrategy;

    fn budget(limit: u64, reserve: u64, keep_last: usize) -> TokenBudgetConfig {
        TokenBudgetConfig {
            limit,
            strategy: BudgetStrategy::FifoDrop,
            reserve,
            keep_last,
            summarizer_model: None,
        }
    }

    fn filled_window() -> MessageWindow {
        let mut window = MessageWindow::new();
        window.push(ChatMessage::system("sys prompt"));
        for i in 0..10 {
            window.push(ChatMessage::user(format!("message number {i} {}", "x".repeat(200))));
        }
        window
    }

    #[test]
    fn estimate_grows_with_content() {
        let mut window = MessageWindow::new();
        assert_eq!(window.estimated_tokens(), 0);
        window.push(ChatMessage::user("abcdefgh"));
        assert_eq!(window.estimated_tokens(), 2 + MESSAGE_OVERHEAD_TOKENS);
    }

    #[test]
    fn prune_fifo_drops_oldest_non_system_first() {
        let mut window = filled_window();
        let b = budget(200, 50, 4);
        assert!(window.needs_pruning(&b));

        let report = window.prune_fifo(&b);
        assert!(report.before > 200);
        assert!(report.after <= 150);
        assert!(report.pruned > 0);
        // System prompt survives.
        assert_eq!(window.messages()[0].role, MessageRole::System);
        // Newest messages survive, oldest were dropped.
        assert!(window
            .messages()
            .last()
            .unwrap()
            .content
            .starts_with("message number 9"));
    }

    #[test]
    fn prune_fifo_never_drops_system() {
        let mut window = MessageWindow::new();
        window.push(ChatMessage::system("s".repeat(4000)));
        let b = budget(10, 0, 4);
        let report = window.prune_fifo(&b);
        assert_eq!(report.pruned, 0);
        assert_eq!(window.len(), 1);
    }

    #[test]
    fn prune_compact_keeps_system_and_recent() {
        let mut window = filled_window();
        let report = window.prune_compact(&budget(200, 50, 3));
        assert_eq!(report.pruned, 7);
        assert_eq!(window.len(), 4); // system + 3
        assert!(window
            .messages()
            .last()
            .unwrap()
            .content
            .starts_with("message number 9"));
    }

    #[test]
    fn take_summarizable_then_insert_summary() {
        let mut window = filled_window();
        let taken = window.take_summarizable(2);
        assert_eq!(taken.len(), 8);
        assert!(taken[0].content.starts_with("message number 0"));
        assert_eq!(window.len(), 3); // system + 2 recent

        window.insert_summary("earlier messages covered 0..8");
        assert_eq!(window.len(), 4);
        assert_eq!(window.messages()[0].role, MessageRole::System);
        assert!(window.messages()[1].content.contains("Summary of earlier"));
    }

    #[test]
    fn last_assistant_text_skips_tool_only_turns() {
        let mut window = MessageWindow::new();
        window.push(ChatMessage::assistant("first answer"));
        window.push(ChatMessage::assistant_with_tools(String::new(), Vec::new()));
        assert_eq!(window.last_assistant_text(), Some("first answer"));
    }
}
