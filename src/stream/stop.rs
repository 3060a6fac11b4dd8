//! Incremental multi-pattern stop detection.
//!
//! Patterns are matched per generated token against the token's
//! detokenized text (with the caller supplying lookback-merged text), or
//! against raw token IDs. A match may span any number of token boundaries;
//! the detector tracks every active prefix and reports where in the
//! overall stream the winning match began.

use crate::runtime::TokenId;

/// A stop trigger: either literal text or an exact token run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopPattern {
    Text(String),
    Tokens(Vec<TokenId>),
}

impl StopPattern {
    pub fn text(s: impl Into<String>) -> Self {
        StopPattern::Text(s.into())
    }
}

/// A completed match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggeredStop {
    /// Text-pattern match over char offsets `[start_char, end_char)` of
    /// the fed stream.
    Text {
        pattern_index: usize,
        start_char: usize,
        end_char: usize,
    },
    /// Token-pattern match over token offsets `[start_token, end_token)`.
    Tokens {
        pattern_index: usize,
        start_token: usize,
        end_token: usize,
    },
}

struct TextMatcher {
    pattern_index: usize,
    chars: Vec<char>,
    /// `(start_char_offset, matched_len)` per live prefix.
    active: Vec<(usize, usize)>,
}

struct TokenMatcher {
    pattern_index: usize,
    tokens: Vec<TokenId>,
    active: Vec<(usize, usize)>,
}

/// Matches all registered patterns simultaneously over a live stream.
pub struct StopSequenceDetector {
    text_matchers: Vec<TextMatcher>,
    token_matchers: Vec<TokenMatcher>,
    chars_seen: usize,
    tokens_seen: usize,
    triggered: Option<TriggeredStop>,
}

impl StopSequenceDetector {
    pub fn new(patterns: &[StopPattern]) -> Self {
        let mut text_matchers = Vec::new();
        let mut token_matchers = Vec::new();
        for (pattern_index, pattern) in patterns.iter().enumerate() {
            match pattern {
                StopPattern::Text(s) if !s.is_empty() => text_matchers.push(TextMatcher {
                    pattern_index,
                    chars: s.chars().collect(),
                    active: Vec::new(),
                }),
                StopPattern::Tokens(t) if !t.is_empty() => token_matchers.push(TokenMatcher {
                    pattern_index,
                    tokens: t.clone(),
                    active: Vec::new(),
                }),
                _ => {}
            }
        }
        Self {
            text_matchers,
            token_matchers,
            chars_seen: 0,
            tokens_seen: 0,
            triggered: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.text_matchers.is_empty() && self.token_matchers.is_empty()
    }

    /// Feed one generated token together with its detokenized text.
    pub fn push_token(&mut self, token: TokenId, text: &str) {
        if self.triggered.is_some() {
            return;
        }
        self.advance_token(token);
        self.push_text(text);
    }

    /// Feed text without advancing the token counters (detokenized merges
    /// that replace earlier sentinel output).
    pub fn push_text(&mut self, text: &str) {
        for c in text.chars() {
            if self.triggered.is_some() {
                return;
            }
            self.advance_char(c);
        }
    }

    fn advance_char(&mut self, c: char) {
        let offset = self.chars_seen;
        self.chars_seen += 1;

        for matcher in &mut self.text_matchers {
            let mut next: Vec<(usize, usize)> = Vec::with_capacity(matcher.active.len() + 1);
            let candidates = matcher
                .active
                .drain(..)
                .chain(std::iter::once((offset, 0)));
            for (start, len) in candidates {
                if matcher.chars[len] == c {
                    if len + 1 == matcher.chars.len() {
                        // First completed match wins.
                        let trigger = TriggeredStop::Text {
                            pattern_index: matcher.pattern_index,
                            start_char: start,
                            end_char: offset + 1,
                        };
                        if self.triggered.is_none() {
                            self.triggered = Some(trigger);
                        }
                    } else {
                        next.push((start, len + 1));
                    }
                }
            }
            matcher.active = next;
        }
    }

    fn advance_token(&mut self, token: TokenId) {
        let offset = self.tokens_seen;
        self.tokens_seen += 1;

        for matcher in &mut self.token_matchers {
            let mut next: Vec<(usize, usize)> = Vec::with_capacity(matcher.active.len() + 1);
            let candidates = matcher
                .active
                .drain(..)
                .chain(std::iter::once((offset, 0)));
            for (start, len) in candidates {
                if matcher.tokens[len] == token {
                    if len + 1 == matcher.tokens.len() {
                        let trigger = TriggeredStop::Tokens {
                            pattern_index: matcher.pattern_index,
                            start_token: start,
                            end_token: offset + 1,
                        };
                        if self.triggered.is_none() {
                            self.triggered = Some(trigger);
                        }
                    } else {
                        next.push((start, len + 1));
                    }
                }
            }
            matcher.active = next;
        }
    }

    /// Whether any pattern is mid-match (a longer input could still
    /// complete it).
    pub fn has_in_progress(&self) -> bool {
        self.triggered.is_none()
            && (self.text_matchers.iter().any(|m| !m.active.is_empty())
                || self.token_matchers.iter().any(|m| !m.active.is_empty()))
    }

    pub fn triggered(&self) -> Option<&TriggeredStop> {
        self.triggered.as_ref()
    }

    /// Chars fed so far (offset space of [`TriggeredStop::Text`]).
    pub fn chars_seen(&self) -> usize {
        self.chars_seen
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_match_spanning_token_boundaries() {
        let mut detector = StopSequenceDetector::new(&[StopPattern::text("</s>")]);

        detector.push_token(0, "Hel");
        assert!(!detector.has_in_progress());
        detector.push_token(1, "lo");
        assert!(!detector.has_in_progress());
        detector.push_token(2, "</");
        assert!(detector.has_in_progress());
        detector.push_token(3, "s>");

        match detector.triggered().unwrap() {
            TriggeredStop::Text {
                start_char,
                end_char,
                ..
            } => {
                assert_eq!(*start_char, 5); // after "Hello"
                assert_eq!(*end_char, 9);
            }
            other => panic!("unexpected trigger {other:?}"),
        }
    }

    #[test]
    fn test_partial_match_ruled_out() {
        let mut detector = StopSequenceDetector::new(&[StopPattern::text("STOP")]);
        detector.push_token(0, "ST");
        assert!(detector.has_in_progress());
        detector.push_token(1, "AY");
        assert!(!detector.has_in_progress());
        assert!(detector.triggered().is_none());
    }

    #[test]
    fn test_overlapping_restart() {
        // "aab" must match inside "aaab".
        let mut detector = StopSequenceDetector::new(&[StopPattern::text("aab")]);
        detector.push_text("aaab");
        assert!(matches!(
            detector.triggered(),
            Some(TriggeredStop::Text {
                start_char: 1,
                end_char: 4,
                ..
            })
        ));
    }

    #[test]
    fn test_token_pattern() {
        let mut detector =
            StopSequenceDetector::new(&[StopPattern::Tokens(vec![7, 8])]);
        detector.push_token(7, "x");
        assert!(detector.has_in_progress());
        detector.push_token(8, "y");
        assert!(matches!(
            detector.triggered(),
            Some(TriggeredStop::Tokens {
                start_token: 0,
                end_token: 2,
                ..
            })
        ));
    }

    #[test]
    fn test_multiple_patterns_earliest_wins() {
        let mut detector = StopSequenceDetector::new(&[
            StopPattern::text("world"),
            StopPattern::text("o w"),
        ]);
        detector.push_text("hello world");
        // "o w" begins at char 4, before "world" at char 6.
        assert!(matches!(
            detector.triggered(),
            Some(TriggeredStop::Text {
                pattern_index: 1,
                start_char: 4,
                ..
            })
        ));
    }
}
