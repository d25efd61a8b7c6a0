//! Wake-phrase matching against user transcripts.

/// A set of phrases, matched as whole words regardless of case and punctuation.
#[derive(Debug, Clone, Default)]
pub struct WakeWords {
    phrases: Vec<String>,
}

impl WakeWords {
    pub fn new<I, S>(phrases: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let phrases = phrases
            .into_iter()
            .map(|p| normalize(p.as_ref()))
            .filter(|p| !p.trim().is_empty())
            .collect();
        Self { phrases }
    }

    pub fn is_empty(&self) -> bool {
        self.phrases.is_empty()
    }

    /// The first configured phrase heard in `transcript`, if any.
    pub fn find(&self, transcript: &str) -> Option<&str> {
        if self.phrases.is_empty() {
            return None;
        }
        let heard = normalize(transcript);
        self.phrases
            .iter()
            .find(|phrase| heard.contains(phrase.as_str()))
            .map(|p| p.trim())
    }
}

/// Lowercases, maps punctuation to spaces and collapses whitespace, padded
/// with one space on each side so `contains` only matches whole words.
fn normalize(text: &str) -> String {
    let cleaned: String = text
        .chars()
        .flat_map(|c| {
            let c = if c.is_alphanumeric() || c == '\'' { c } else { ' ' };
            c.to_lowercase()
        })
        .collect();
    let words: Vec<&str> = cleaned.split_whitespace().collect();
    format!(" {} ", words.join(" "))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matches_case_and_punctuation_insensitively() {
        let wake = WakeWords::new(["Hey Robot"]);
        assert_eq!(wake.find("hey, robot! are you there?"), Some("hey robot"));
        assert_eq!(wake.find("HEY ROBOT"), Some("hey robot"));
    }

    #[test]
    fn test_requires_whole_words() {
        let wake = WakeWords::new(["wake"]);
        assert_eq!(wake.find("I am awake"), None);
        assert_eq!(wake.find("please wake up"), Some("wake"));
    }

    #[test]
    fn test_empty_configuration_never_matches() {
        let wake = WakeWords::new(Vec::<String>::new());
        assert!(wake.is_empty());
        assert_eq!(wake.find("anything"), None);

        let blank = WakeWords::new(["  ", ""]);
        assert!(blank.is_empty());
    }
}
