//! Token normalization applied to chunks before lexical indexing and to
//! queries before lexical lookup.

use parking_lot::Mutex;
use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};

use crate::error::{AgentError, AgentResult};

/// Pictographs, dingbats, flags and joiners. The face block (U+1F600..U+1F64F)
/// is left to [`EMOTICON_RE`].
static EMOJI_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(concat!(
        "[",
        r"\x{1F300}-\x{1F5FF}",
        r"\x{1F680}-\x{1F6FF}",
        r"\x{1F1E0}-\x{1F1FF}",
        r"\x{1F900}-\x{1F9FF}",
        r"\x{1FA70}-\x{1FAFF}",
        r"\x{2600}-\x{2638}",
        r"\x{263B}-\x{26FF}",
        r"\x{2700}-\x{27BF}",
        r"\x{FE0F}\x{200D}",
        "]"
    ))
    .expect("emoji pattern is valid")
});

static EMOTICON_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[\x{1F600}-\x{1F64F}\x{2639}\x{263A}\x{30C4}]").expect("emoticon pattern is valid")
});

/// Stop-word sets keyed by path, loaded once per process.
static STOPWORD_CACHE: LazyLock<Mutex<HashMap<PathBuf, Arc<HashSet<String>>>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

#[derive(Debug, Clone, Default)]
pub struct NormalizerOptions {
    pub remove_emoji: bool,
    pub remove_emoticons: bool,
    pub stopwords_path: Option<PathBuf>,
}

/// Lowercases, strips punctuation, optionally strips emoji/emoticons and stop
/// words, then splits on whitespace.
#[derive(Debug, Clone, Default)]
pub struct TextNormalizer {
    remove_emoji: bool,
    remove_emoticons: bool,
    stopwords: Option<Arc<HashSet<String>>>,
}

impl TextNormalizer {
    /// Fails with a configuration error if the stop-word file cannot be read.
    pub fn new(options: NormalizerOptions) -> AgentResult<Self> {
        let stopwords = match options.stopwords_path {
            Some(ref path) => Some(load_stopwords(path)?),
            None => None,
        };
        Ok(Self {
            remove_emoji: options.remove_emoji,
            remove_emoticons: options.remove_emoticons,
            stopwords,
        })
    }

    pub fn normalize(&self, text: &str) -> Vec<String> {
        let mut normalized: String = text
            .to_lowercase()
            .chars()
            .filter(|c| !c.is_ascii_punctuation())
            .collect();

        if self.remove_emoji {
            normalized = EMOJI_RE.replace_all(&normalized, "").into_owned();
        }
        if self.remove_emoticons {
            normalized = EMOTICON_RE.replace_all(&normalized, "").into_owned();
        }

        normalized
            .split_whitespace()
            .filter(|token| match self.stopwords {
                Some(ref words) => !words.contains(*token),
                None => true,
            })
            .map(str::to_string)
            .collect()
    }

    pub fn has_stopwords(&self) -> bool {
        self.stopwords.is_some()
    }
}

fn load_stopwords(path: &Path) -> AgentResult<Arc<HashSet<String>>> {
    let mut cache = STOPWORD_CACHE.lock();
    if let Some(words) = cache.get(path) {
        return Ok(Arc::clone(words));
    }

    let content = std::fs::read_to_string(path).map_err(|e| {
        AgentError::configuration(format!(
            "Cannot read stop-word file {}: {}",
            path.display(),
            e
        ))
    })?;
    let words: HashSet<String> = content
        .split_whitespace()
        .map(|w| w.to_lowercase())
        .collect();

    tracing::debug!(path = %path.display(), count = words.len(), "Loaded stop words");
    let words = Arc::new(words);
    cache.insert(path.to_path_buf(), Arc::clone(&words));
    Ok(words)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn normalizer(remove_emoji: bool, remove_emoticons: bool, stopwords: Option<PathBuf>) -> TextNormalizer {
        TextNormalizer::new(NormalizerOptions {
            remove_emoji,
            remove_emoticons,
            stopwords_path: stopwords,
        })
        .unwrap()
    }

    #[test]
    fn test_lowercase_and_punctuation() {
        let n = normalizer(false, false, None);
        assert_eq!(n.normalize("Hello, World! It's  fine."), vec!["hello", "world", "its", "fine"]);
    }

    #[test]
    fn test_emoji_and_emoticon_are_independent() {
        let text = "pump 🚀 ok 😀 done";
        assert_eq!(normalizer(true, false, None).normalize(text), vec!["pump", "ok", "😀", "done"]);
        assert_eq!(normalizer(false, true, None).normalize(text), vec!["pump", "🚀", "ok", "done"]);
        assert_eq!(normalizer(true, true, None).normalize(text), vec!["pump", "ok", "done"]);
    }

    #[test]
    fn test_non_latin_text_survives() {
        let n = normalizer(true, true, None);
        assert_eq!(n.normalize("Máy bơm hỏng?"), vec!["máy", "bơm", "hỏng"]);
    }

    #[test]
    fn test_stopwords_removed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stop.txt");
        std::fs::write(&path, "the\nA\nof\n").unwrap();
        let n = normalizer(false, false, Some(path));
        assert!(n.has_stopwords());
        assert_eq!(n.normalize("The manual of a pump"), vec!["manual", "pump"]);
    }

    #[test]
    fn test_unreadable_stopwords_is_configuration_error() {
        let err = TextNormalizer::new(NormalizerOptions {
            stopwords_path: Some(PathBuf::from("/nonexistent/docent/stop.txt")),
            ..Default::default()
        })
        .unwrap_err();
        assert!(matches!(err, AgentError::Configuration(_)));
    }

    #[test]
    fn test_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stop.txt");
        std::fs::write(&path, "is\nthe").unwrap();
        let n = normalizer(true, true, Some(path));
        let samples = [
            "The pump IS broken!!! 😀🚀 see §4.2",
            "  ツ smile ☺ ... ",
            "Ça va? Très-bien, merci.",
            "",
        ];
        for sample in samples {
            let once = n.normalize(sample);
            let twice = n.normalize(&once.join(" "));
            assert_eq!(once, twice, "not idempotent for {:?}", sample);
        }
    }
}
