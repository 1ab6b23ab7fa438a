//! Sentence segmentation for streamed text

/// Characters that end a sentence
pub const TERMINATORS: [char; 6] = ['。', '．', '！', '？', '!', '?'];

fn is_terminator(c: char) -> bool {
    TERMINATORS.contains(&c)
}

/// Cuts a growing text buffer into sentences.
///
/// A sentence ends at a terminator (runs like `！？` stay together, trailing
/// whitespace is absorbed) or once `max_len` characters have accumulated
/// without one.
#[derive(Debug, Clone, Copy)]
pub struct SentenceSegmenter {
    max_len: usize,
}

impl SentenceSegmenter {
    pub fn new(max_len: usize) -> Self {
        Self {
            max_len: max_len.max(1),
        }
    }

    pub fn max_len(&self) -> usize {
        self.max_len
    }

    /// Remove the next complete sentence from the front of `buffer`.
    ///
    /// With `flush`, whatever remains counts as a final sentence. Pieces that
    /// are only whitespace or punctuation are dropped.
    pub fn next_sentence(&self, buffer: &mut String, flush: bool) -> Option<String> {
        loop {
            let cut = self.find_cut(buffer, flush)?;
            let rest = buffer.split_off(cut);
            let piece = std::mem::replace(buffer, rest);
            let trimmed = piece.trim();
            if trimmed.is_empty() || trimmed.chars().all(is_terminator) {
                continue;
            }
            return Some(trimmed.to_string());
        }
    }

    /// Split a complete text in one go
    pub fn split(&self, text: &str) -> Vec<String> {
        let mut buffer = text.to_string();
        std::iter::from_fn(|| self.next_sentence(&mut buffer, true)).collect()
    }

    fn find_cut(&self, buffer: &str, flush: bool) -> Option<usize> {
        let mut chars = buffer.char_indices().peekable();
        let mut count = 0;
        while let Some((i, c)) = chars.next() {
            count += 1;
            if is_terminator(c) {
                let mut end = i + c.len_utf8();
                while let Some(&(j, next)) = chars.peek() {
                    if is_terminator(next) || next.is_whitespace() {
                        end = j + next.len_utf8();
                        chars.next();
                    } else {
                        break;
                    }
                }
                return Some(end);
            }
            if count >= self.max_len {
                return Some(i + c.len_utf8());
            }
        }
        if flush && !buffer.is_empty() {
            Some(buffer.len())
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(segmenter: &SentenceSegmenter, fragments: &[&str]) -> Vec<String> {
        let mut buffer = String::new();
        let mut out = Vec::new();
        for fragment in fragments {
            buffer.push_str(fragment);
            while let Some(sentence) = segmenter.next_sentence(&mut buffer, false) {
                out.push(sentence);
            }
        }
        while let Some(sentence) = segmenter.next_sentence(&mut buffer, true) {
            out.push(sentence);
        }
        out
    }

    #[test]
    fn test_fragments_join_until_terminator() {
        let segmenter = SentenceSegmenter::new(80);
        let out = feed(&segmenter, &["こんにちは。", "今日は", "晴れです。"]);
        assert_eq!(out, vec!["こんにちは。", "今日は晴れです。"]);
    }

    #[test]
    fn test_partial_sentence_waits_without_flush() {
        let segmenter = SentenceSegmenter::new(80);
        let mut buffer = "今日は".to_string();
        assert_eq!(segmenter.next_sentence(&mut buffer, false), None);
        assert_eq!(buffer, "今日は");
        assert_eq!(segmenter.next_sentence(&mut buffer, true), Some("今日は".to_string()));
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_splits_inside_a_fragment() {
        let segmenter = SentenceSegmenter::new(80);
        let out = segmenter.split("本当に？ はい！そうです。 Really?! Yes");
        assert_eq!(out, vec!["本当に？", "はい！", "そうです。", "Really?!", "Yes"]);
    }

    #[test]
    fn test_max_length_cut() {
        let segmenter = SentenceSegmenter::new(5);
        let out = feed(&segmenter, &["あいうえおかきくけこさし"]);
        assert_eq!(out, vec!["あいうえお", "かきくけこ", "さし"]);
    }

    #[test]
    fn test_punctuation_only_pieces_dropped() {
        let segmenter = SentenceSegmenter::new(80);
        let out = feed(&segmenter, &["ありがとう!", "!", "   "]);
        assert_eq!(out, vec!["ありがとう!"]);
    }

    #[test]
    fn test_ascii_period_does_not_split() {
        let segmenter = SentenceSegmenter::new(80);
        assert_eq!(segmenter.split("円周率は3.14です。"), vec!["円周率は3.14です。"]);
    }
}
