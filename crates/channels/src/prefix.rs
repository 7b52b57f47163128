//! Bot-voice prefix policy and message splitting.
//!
//! On shared-identity transports (the bot sends from the owner's own
//! account) every autonomous outbound message carries a marker, default
//! `"[gbot] "`. The same marker is the loop-break filter: an inbound
//! message from "self" that starts with it is one of ours echoed back,
//! and must be dropped before it reaches the runner.

/// The bot-voice marker. One value serves both directions.
#[derive(Debug, Clone)]
pub struct BotVoice {
    marker: String,
}

impl BotVoice {
    pub fn new(marker: impl Into<String>) -> Self {
        Self {
            marker: marker.into(),
        }
    }

    pub fn marker(&self) -> &str {
        &self.marker
    }

    /// Prefix outbound text. Already-prefixed text is left alone.
    pub fn apply(&self, text: &str) -> String {
        if self.marker.is_empty() || text.starts_with(&self.marker) {
            return text.to_string();
        }
        format!("{}{}", self.marker, text)
    }

    /// Is this inbound message our own voice echoed back?
    pub fn is_self_echo(&self, text: &str, is_from_self: bool) -> bool {
        is_from_self && !self.marker.is_empty() && text.starts_with(&self.marker)
    }
}

impl Default for BotVoice {
    fn default() -> Self {
        Self::new("[gbot] ")
    }
}

/// Split a long message on paragraph boundaries under `limit` bytes.
/// A single paragraph longer than the limit is hard-split on char
/// boundaries.
pub fn split_message(text: &str, limit: usize) -> Vec<String> {
    if limit == 0 || text.len() <= limit {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut current = String::new();

    for paragraph in text.split("\n\n") {
        let needed = if current.is_empty() {
            paragraph.len()
        } else {
            current.len() + 2 + paragraph.len()
        };
        if needed <= limit {
            if !current.is_empty() {
                current.push_str("\n\n");
            }
            current.push_str(paragraph);
            continue;
        }

        if !current.is_empty() {
            chunks.push(std::mem::take(&mut current));
        }
        if paragraph.len() <= limit {
            current.push_str(paragraph);
        } else {
            // Oversized paragraph: hard-split on char boundaries
            let mut rest = paragraph;
            while rest.len() > limit {
                let mut end = limit;
                while end > 0 && !rest.is_char_boundary(end) {
                    end -= 1;
                }
                chunks.push(rest[..end].to_string());
                rest = &rest[end..];
            }
            current.push_str(rest);
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apply_prefixes_once() {
        let voice = BotVoice::default();
        assert_eq!(voice.apply("hello"), "[gbot] hello");
        assert_eq!(voice.apply("[gbot] hello"), "[gbot] hello");
    }

    #[test]
    fn self_echo_requires_both_conditions() {
        let voice = BotVoice::default();
        assert!(voice.is_self_echo("[gbot] merhaba", true));
        assert!(!voice.is_self_echo("[gbot] merhaba", false));
        assert!(!voice.is_self_echo("merhaba", true));
    }

    #[test]
    fn empty_marker_disables_the_policy() {
        let voice = BotVoice::new("");
        assert_eq!(voice.apply("hello"), "hello");
        assert!(!voice.is_self_echo("hello", true));
    }

    #[test]
    fn short_message_is_one_chunk() {
        assert_eq!(split_message("hi", 100), vec!["hi"]);
    }

    #[test]
    fn splits_on_paragraph_boundaries() {
        let text = format!("{}\n\n{}\n\n{}", "a".repeat(40), "b".repeat(40), "c".repeat(40));
        let chunks = split_message(&text, 90);
        assert_eq!(chunks.len(), 2);
        assert!(chunks[0].contains("aaaa"));
        assert!(chunks[0].contains("bbbb"));
        assert!(chunks[1].contains("cccc"));
        // Nothing lost
        assert_eq!(chunks.join("\n\n"), text);
    }

    #[test]
    fn oversized_paragraph_hard_splits() {
        let text = "x".repeat(250);
        let chunks = split_message(&text, 100);
        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|c| c.len() <= 100));
        assert_eq!(chunks.concat(), text);
    }

    #[test]
    fn hard_split_respects_char_boundaries() {
        let text = "ğ".repeat(100); // 200 bytes
        let chunks = split_message(&text, 33);
        assert!(chunks.iter().all(|c| c.len() <= 33));
        assert_eq!(chunks.concat(), text);
    }
}
