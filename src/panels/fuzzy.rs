//! Fuzzy matching of spoken panel commands.
//!
//! A command phrase contained in the utterance wins outright (the longest
//! such phrase when several are contained). Otherwise the phrase with the
//! smallest Levenshtein distance to the whole utterance wins, provided the
//! distance is within `min(5, floor(len * 0.3))`.

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandAction {
    Start,
    Save,
    Clear,
    Cancel,
}

/// Phrases that trigger one action. The first phrase is the canonical one.
#[derive(Debug)]
pub struct CommandGroup {
    pub action: CommandAction,
    pub phrases: &'static [&'static str],
}

impl CommandGroup {
    pub fn canonical(&self) -> &'static str {
        self.phrases.first().copied().unwrap_or("")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommandMatch {
    pub action: CommandAction,
    pub canonical: &'static str,
    pub phrase: &'static str,
    pub distance: usize,
}

pub fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0; b.len() + 1];

    for (i, ca) in a.iter().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != cb);
            curr[j + 1] = (prev[j + 1] + 1).min(curr[j] + 1).min(prev[j] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len()]
}

pub fn threshold(input: &str) -> usize {
    let len = input.chars().count();
    (len * 3 / 10).min(5)
}

/// Lowercase, turn punctuation into spaces and collapse whitespace.
pub fn normalize(text: &str) -> String {
    let cleaned: String = text
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '\'' { c } else { ' ' })
        .collect();
    cleaned.split_whitespace().collect::<Vec<_>>().join(" ")
}

pub fn match_command(utterance: &str, groups: &[CommandGroup]) -> Option<CommandMatch> {
    let text = normalize(utterance);
    if text.is_empty() {
        return None;
    }

    let padded = format!(" {} ", text);
    let mut contained: Option<CommandMatch> = None;
    for group in groups {
        for &phrase in group.phrases {
            if !padded.contains(&format!(" {} ", phrase)) {
                continue;
            }
            if contained.as_ref().is_none_or(|best| phrase.len() > best.phrase.len()) {
                contained = Some(CommandMatch {
                    action: group.action,
                    canonical: group.canonical(),
                    phrase,
                    distance: 0,
                });
            }
        }
    }
    if contained.is_some() {
        return contained;
    }

    let limit = threshold(&text);
    let mut best: Option<CommandMatch> = None;
    for group in groups {
        for &phrase in group.phrases {
            let distance = levenshtein(&text, phrase);
            if distance > limit {
                continue;
            }
            if best.as_ref().is_none_or(|b| distance < b.distance) {
                best = Some(CommandMatch {
                    action: group.action,
                    canonical: group.canonical(),
                    phrase,
                    distance,
                });
            }
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;

    const GROUPS: &[CommandGroup] = &[
        CommandGroup {
            action: CommandAction::Start,
            phrases: &["start drug dispatch", "drug dispatch", "drugs dispatch"],
        },
        CommandGroup {
            action: CommandAction::Cancel,
            phrases: &["cancel drug dispatch"],
        },
    ];

    #[test]
    fn distance_counts_edits() {
        assert_eq!(levenshtein("kitten", "sitting"), 3);
        assert_eq!(levenshtein("", "abc"), 3);
        assert_eq!(levenshtein("same", "same"), 0);
        assert_eq!(levenshtein("drove dispatch", "drug dispatch"), 3);
    }

    #[test]
    fn threshold_is_capped() {
        assert_eq!(threshold("drove dispatch"), 4);
        assert_eq!(threshold("a very long utterance indeed"), 5);
        assert_eq!(threshold("abc"), 0);
    }

    #[test]
    fn misheard_start_resolves_to_canonical() {
        let found = match_command("drove dispatch", GROUPS).unwrap();
        assert_eq!(found.action, CommandAction::Start);
        assert_eq!(found.canonical, "start drug dispatch");
        assert_eq!(found.distance, 3);
    }

    #[test]
    fn longest_contained_phrase_wins() {
        let found = match_command("Okay, cancel drug dispatch please.", GROUPS).unwrap();
        assert_eq!(found.action, CommandAction::Cancel);
        assert_eq!(found.distance, 0);
    }

    #[test]
    fn unrelated_speech_does_not_match() {
        assert!(match_command("completely unrelated phrase", GROUPS).is_none());
        assert!(match_command("   ", GROUPS).is_none());
    }
}
