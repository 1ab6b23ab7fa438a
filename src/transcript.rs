//! Transcript heuristics: self-echo detection, coherence scoring and cleanup
//!
//! Speech-to-text output is checked before it is allowed to interrupt the
//! agent. Two things get rejected:
//!
//! - **Self-echo**: the microphone picked up the agent's own voice, so the
//!   transcript closely matches something the agent just said.
//! - **Noise**: broken recognition output (fillers, fragments, repetition).

use crate::config::{Replacement, TurnConfig};
use std::collections::{HashMap, HashSet, VecDeque};
use tracing::debug;

const SENTENCE_ENDS: [char; 6] = ['。', '！', '？', '!', '?', '\n'];
const TRAILING_MARKS: [char; 7] = ['、', '。', ',', '．', '，', '…', '.'];

const DEFAULT_FILLERS: [&str; 14] = [
    "えー", "えっと", "えーっと", "あの", "あのー", "その", "まー", "まあ", "なんか", "みたいな",
    "うーん", "え", "えと", "そのー",
];

/// Length of the longest common subsequence of two character slices
fn lcs_len(a: &[char], b: &[char]) -> usize {
    if a.is_empty() || b.is_empty() {
        return 0;
    }
    let mut prev = vec![0usize; b.len() + 1];
    let mut cur = vec![0usize; b.len() + 1];
    for &ca in a {
        for (j, &cb) in b.iter().enumerate() {
            cur[j + 1] = if ca == cb {
                prev[j] + 1
            } else {
                cur[j].max(prev[j + 1])
            };
        }
        std::mem::swap(&mut prev, &mut cur);
    }
    prev[b.len()]
}

/// `2 * matches / total`, in 0.0..=1.0
pub fn similarity_ratio(a: &str, b: &str) -> f32 {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    ratio(&a, &b)
}

fn ratio(a: &[char], b: &[char]) -> f32 {
    let total = a.len() + b.len();
    if total == 0 {
        return 1.0;
    }
    2.0 * lcs_len(a, b) as f32 / total as f32
}

/// Best similarity of `a` against any window of `b`, with the window found.
///
/// Windows range from 0.6 to 1.4 times the length of `a`. When `b` is no
/// longer than the largest window it is compared whole.
pub fn max_substring_similarity(a: &str, b: &str) -> (f32, String) {
    let a: Vec<char> = a.trim().chars().collect();
    let b: Vec<char> = b.trim().chars().collect();
    if a.is_empty() || b.is_empty() {
        return (0.0, String::new());
    }

    let target = a.len();
    let min_len = ((target as f32 * 0.6) as usize).max(1);
    let max_len = ((target as f32 * 1.4) as usize).max(min_len);

    if b.len() <= max_len {
        return (ratio(&a, &b), b.iter().collect());
    }

    let mut best = 0.0f32;
    let mut best_at = (0, 0);
    let coarse = (target / 5).max(1);
    for len in (min_len..=max_len).step_by(coarse) {
        let fine = (len / 6).max(1);
        for start in (0..=b.len() - len).step_by(fine) {
            let r = ratio(&a, &b[start..start + len]);
            if r > best {
                best = r;
                best_at = (start, len);
            }
        }
    }
    let (start, len) = best_at;
    (best, b[start..start + len].iter().collect())
}

/// Apply configured misrecognition fix-ups in order
pub fn apply_replacements(text: &str, replacements: &[Replacement]) -> String {
    replacements
        .iter()
        .filter(|r| !r.from.is_empty())
        .fold(text.to_string(), |acc, r| acc.replace(&r.from, &r.to))
}

/// Remove `name:` labels the model sometimes writes into its own replies
pub fn strip_speaker_prefix(text: &str, name: &str) -> String {
    if name.is_empty() {
        return text.trim().to_string();
    }
    text.replace(&format!("{}:", name), "")
        .replace(&format!("{}：", name), "")
        .trim()
        .to_string()
}

/// Heuristic coherence scorer for recognized speech
#[derive(Debug, Clone)]
pub struct CoherenceFilter {
    threshold: f32,
    min_fragment_chars: usize,
    fillers: HashSet<String>,
}

impl Default for CoherenceFilter {
    fn default() -> Self {
        Self::new(0.45, 8)
    }
}

impl CoherenceFilter {
    pub fn new(threshold: f32, min_fragment_chars: usize) -> Self {
        Self {
            threshold,
            min_fragment_chars,
            fillers: DEFAULT_FILLERS.iter().map(|f| f.to_string()).collect(),
        }
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    pub fn set_threshold(&mut self, threshold: f32) {
        self.threshold = threshold;
    }

    pub fn add_fillers<'a>(&mut self, words: impl IntoIterator<Item = &'a str>) {
        self.fillers
            .extend(words.into_iter().filter(|w| !w.is_empty()).map(str::to_string));
    }

    /// Split into sentences, dropping ones that are only a filler word
    pub fn split_sentences(&self, text: &str) -> Vec<String> {
        let normalized = text.split_whitespace().collect::<Vec<_>>().join(" ");

        let mut sentences = Vec::new();
        let mut current = String::new();
        for c in normalized.chars() {
            current.push(c);
            if SENTENCE_ENDS.contains(&c) {
                sentences.push(std::mem::take(&mut current));
            }
        }
        sentences.push(current);

        sentences
            .into_iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .filter(|s| !self.fillers.contains(s.trim_end_matches(TRAILING_MARKS)))
            .collect()
    }

    /// Score in 0.0..=1.0; higher means more coherent
    pub fn coherence_score(&self, text: &str) -> f32 {
        let sentences = self.split_sentences(text);
        match sentences.len() {
            0 => 0.0,
            1 => {
                let s = &sentences[0];
                let base = if s.chars().count() >= self.min_fragment_chars {
                    1.0
                } else {
                    0.5
                };
                let chars: Vec<char> = s.chars().collect();
                let penalty = 0.15 * (repetition_ratio(&chars) * 3.0).min(1.0);
                (base - penalty).clamp(0.0, 1.0)
            }
            n => {
                let grams: Vec<_> = sentences.iter().map(|s| char_bigrams(s)).collect();
                let jaccard_mean =
                    grams.windows(2).map(|w| jaccard(&w[0], &w[1])).sum::<f32>() / (n - 1) as f32;

                let fragments = sentences
                    .iter()
                    .filter(|s| s.chars().count() < self.min_fragment_chars)
                    .count() as f32
                    / n as f32;
                let chars: Vec<char> = sentences.concat().chars().collect();
                let repetition = (repetition_ratio(&chars) * 3.0).min(1.0);

                let score = 0.9 * jaccard_mean.clamp(0.0, 1.0);
                let penalty = 0.1 * (0.6 * fragments + 0.4 * repetition);
                (score - penalty).clamp(0.0, 1.0)
            }
        }
    }

    /// `(noisy, score)`
    pub fn is_noisy(&self, text: &str) -> (bool, f32) {
        let score = self.coherence_score(text);
        debug!("Coherence {:.3} (threshold {:.2})", score, self.threshold);
        (score < self.threshold, score)
    }
}

fn char_bigrams(s: &str) -> HashSet<(char, char)> {
    let chars: Vec<char> = s.chars().filter(|c| !c.is_whitespace()).collect();
    chars.windows(2).map(|w| (w[0], w[1])).collect()
}

fn jaccard(a: &HashSet<(char, char)>, b: &HashSet<(char, char)>) -> f32 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let union = a.union(b).count();
    if union == 0 {
        return 0.0;
    }
    a.intersection(b).count() as f32 / union as f32
}

/// Share of character bigrams that occur more than once
fn repetition_ratio(chars: &[char]) -> f32 {
    if chars.len() < 2 {
        return 0.0;
    }
    let mut counts: HashMap<(char, char), usize> = HashMap::new();
    for w in chars.windows(2) {
        *counts.entry((w[0], w[1])).or_default() += 1;
    }
    let repeats: usize = counts.values().filter(|&&n| n > 1).sum();
    repeats as f32 / (chars.len() - 1) as f32
}

/// Why a transcript was or wasn't accepted
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Accept,
    /// Too close to what the agent just said
    Echo { similarity: f32, matched: String },
    /// Failed the coherence check
    Noise { score: f32 },
}

impl Verdict {
    pub fn accepted(&self) -> bool {
        matches!(self, Verdict::Accept)
    }
}

/// Gate for final transcripts before they reach the conversation
#[derive(Debug, Clone)]
pub struct TranscriptFilter {
    coherence: CoherenceFilter,
    echo_similarity: f32,
}

impl TranscriptFilter {
    pub fn new(coherence: CoherenceFilter, echo_similarity: f32) -> Self {
        Self {
            coherence,
            echo_similarity,
        }
    }

    pub fn from_config(config: &TurnConfig) -> Self {
        Self::new(
            CoherenceFilter::new(config.coherence_threshold, config.min_fragment_chars),
            config.echo_similarity,
        )
    }

    pub fn check(&self, transcript: &str, last_spoken: Option<&str>) -> Verdict {
        let transcript = transcript.trim();
        if transcript.is_empty() {
            return Verdict::Noise { score: 0.0 };
        }

        if let Some(spoken) = last_spoken.filter(|s| !s.trim().is_empty()) {
            let (similarity, matched) = max_substring_similarity(transcript, spoken);
            if similarity >= self.echo_similarity {
                return Verdict::Echo {
                    similarity,
                    matched,
                };
            }
        }

        let (noisy, score) = self.coherence.is_noisy(transcript);
        if noisy {
            return Verdict::Noise { score };
        }
        Verdict::Accept
    }
}

/// Rolling "name: message" transcript used as model context
#[derive(Debug, Clone)]
pub struct ConversationHistory {
    lines: VecDeque<String>,
    max_lines: usize,
}

impl ConversationHistory {
    pub fn new(max_lines: usize) -> Self {
        Self {
            lines: VecDeque::new(),
            max_lines: max_lines.max(1),
        }
    }

    pub fn push(&mut self, name: &str, message: &str) {
        self.lines.push_back(format!("{}: {}", name, message));
        while self.lines.len() > self.max_lines {
            self.lines.pop_front();
        }
    }

    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.lines.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn clear(&mut self) {
        self.lines.clear();
    }

    /// One line per entry, each ending in a newline
    pub fn render(&self) -> String {
        self.lines.iter().fold(String::new(), |mut out, line| {
            out.push_str(line);
            out.push('\n');
            out
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_similarity_ratio() {
        assert_eq!(similarity_ratio("こんにちは", "こんにちは"), 1.0);
        assert_eq!(similarity_ratio("abc", "xyz"), 0.0);
        // lcs("abcd", "abxd") = 3
        assert!((similarity_ratio("abcd", "abxd") - 0.75).abs() < 1e-6);
    }

    #[test]
    fn test_substring_similarity_finds_window() {
        let (score, window) =
            max_substring_similarity("今日は晴れです", "こんにちは。今日は晴れですね。明日は雨でしょう。");
        assert!((score - 1.0).abs() < 1e-6);
        assert_eq!(window, "今日は晴れです");
    }

    #[test]
    fn test_substring_similarity_short_reference_compared_whole() {
        let (score, window) = max_substring_similarity("こんにちは元気ですか", "こんにちは、元気ですか。");
        assert_eq!(window, "こんにちは、元気ですか。");
        assert!(score > 0.9);
    }

    #[test]
    fn test_substring_similarity_unrelated_and_empty() {
        let (score, _) = max_substring_similarity("ありがとう", "明日は雨でしょう");
        assert!(score < 0.4);
        assert_eq!(max_substring_similarity("", "abc"), (0.0, String::new()));
        assert_eq!(max_substring_similarity("abc", "  "), (0.0, String::new()));
    }

    #[test]
    fn test_split_drops_fillers() {
        let filter = CoherenceFilter::default();
        let sentences = filter.split_sentences("えっと。  今日は   晴れ！あの、");
        assert_eq!(sentences, vec!["今日は 晴れ！"]);
    }

    #[test]
    fn test_single_sentence_scores() {
        let filter = CoherenceFilter::new(0.45, 4);
        assert_eq!(filter.coherence_score("今日はいい天気ですね"), 1.0);
        assert_eq!(filter.coherence_score("はい"), 0.5);
        // Every bigram repeats
        let score = filter.coherence_score("ははははははは");
        assert!((score - 0.85).abs() < 1e-6);
        assert_eq!(filter.coherence_score(""), 0.0);
        assert_eq!(filter.coherence_score("えっと。"), 0.0);
    }

    #[test]
    fn test_unrelated_sentences_are_noisy() {
        let filter = CoherenceFilter::new(0.45, 4);
        let (noisy, score) = filter.is_noisy("えっと。冷蔵庫が壊れた。予算案は未確定です。");
        assert!(noisy);
        assert_eq!(score, 0.0);

        let related = filter.coherence_score("売上が増えました。売上が増えた理由は広告です。");
        assert!(related > score);
    }

    #[test]
    fn test_replacements_and_prefix() {
        let replacements = vec![
            Replacement {
                from: "春".into(),
                to: "ハロ".into(),
            },
            Replacement {
                from: "".into(),
                to: "x".into(),
            },
        ];
        assert_eq!(apply_replacements("春、おはよう", &replacements), "ハロ、おはよう");
        assert_eq!(strip_speaker_prefix("ハロ: はい！", "ハロ"), "はい！");
        assert_eq!(strip_speaker_prefix("ハロ：はい！", "ハロ"), "はい！");
        assert_eq!(strip_speaker_prefix(" はい ", ""), "はい");
    }

    #[test]
    fn test_filter_verdicts() {
        let filter = TranscriptFilter::new(CoherenceFilter::new(0.45, 4), 0.75);
        assert!(matches!(
            filter.check("こんにちは元気ですか", Some("こんにちは、元気ですか。")),
            Verdict::Echo { .. }
        ));
        assert_eq!(filter.check("ちょっと待って", Some("長いお話をします。")), Verdict::Accept);
        assert_eq!(filter.check("ちょっと待って", None), Verdict::Accept);
        assert!(matches!(filter.check("えっと。", None), Verdict::Noise { .. }));
        assert!(matches!(filter.check("   ", None), Verdict::Noise { .. }));
    }

    #[test]
    fn test_history_is_bounded() {
        let mut history = ConversationHistory::new(2);
        assert!(history.is_empty());
        history.push("ユーザー", "一");
        history.push("ハロ", "二");
        history.push("ユーザー", "三");
        assert_eq!(history.len(), 2);
        assert_eq!(history.render(), "ハロ: 二\nユーザー: 三\n");
        assert_eq!(history.lines().next(), Some("ハロ: 二"));
    }
}
