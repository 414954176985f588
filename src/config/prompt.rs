use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{ Path, PathBuf };
use std::str::FromStr;
use std::sync::{ Arc, RwLock };
use std::time::SystemTime;
use log::{ info, warn };
use thiserror::Error;

pub const DEFAULT_PROMPT: &str =
    "You are a friendly and patient Japanese instructor. Answer the learner's questions about \
Japanese vocabulary, grammar, reading and culture. Give Japanese examples with furigana in \
parentheses and an English translation, and gently correct any mistakes the learner makes.";

const N5_PROMPT: &str =
    "You are a Japanese instructor teaching an absolute beginner at JLPT N5 level. Use only \
hiragana, katakana and the most basic kanji (always with furigana). Keep sentences short and \
in polite です/ます form. Explain everything in simple English, introduce at most one new \
grammar point at a time, and end with a tiny practice question.";

const N4_PROMPT: &str =
    "You are a Japanese instructor teaching a learner at JLPT N4 level. Use basic kanji with \
furigana for anything beyond N5. Cover everyday topics, て-form, plain form, potential and \
simple conditionals. Explain in English, give two or three example sentences with translations, \
and correct mistakes with a short explanation.";

const N3_PROMPT: &str =
    "You are a Japanese instructor teaching an intermediate learner at JLPT N3 level. Mix Japanese \
and English, with furigana only for kanji above N3. Practice natural conversation, passive and \
causative forms, and common expressions like ～ようにする and ～ことになる. Point out more \
natural phrasing when the learner sounds textbook-like.";

const N2_PROMPT: &str =
    "You are a Japanese instructor teaching an upper-intermediate learner at JLPT N2 level. Reply \
mostly in Japanese and switch to English only for difficult explanations. Use newspaper and \
workplace vocabulary, formal written grammar and keigo. Compare similar grammar patterns and \
explain nuance differences.";

const N1_PROMPT: &str =
    "You are a Japanese instructor coaching an advanced learner at JLPT N1 level. Reply in natural, \
sophisticated Japanese. Discuss abstract and academic topics, literary and idiomatic expressions \
(四字熟語, ことわざ) and subtle register differences. Correct mistakes in Japanese and explain \
only when asked.";

/// JLPT proficiency levels, ordered from beginner to advanced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum JlptLevel {
    N5,
    N4,
    N3,
    N2,
    N1,
}

impl JlptLevel {
    pub const ALL: [JlptLevel; 5] = [
        JlptLevel::N5,
        JlptLevel::N4,
        JlptLevel::N3,
        JlptLevel::N2,
        JlptLevel::N1,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JlptLevel::N5 => "N5",
            JlptLevel::N4 => "N4",
            JlptLevel::N3 => "N3",
            JlptLevel::N2 => "N2",
            JlptLevel::N1 => "N1",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            JlptLevel::N5 => "Beginner",
            JlptLevel::N4 => "Elementary",
            JlptLevel::N3 => "Intermediate",
            JlptLevel::N2 => "Upper intermediate",
            JlptLevel::N1 => "Advanced",
        }
    }

    pub fn builtin_prompt(&self) -> &'static str {
        match self {
            JlptLevel::N5 => N5_PROMPT,
            JlptLevel::N4 => N4_PROMPT,
            JlptLevel::N3 => N3_PROMPT,
            JlptLevel::N2 => N2_PROMPT,
            JlptLevel::N1 => N1_PROMPT,
        }
    }
}

impl fmt::Display for JlptLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JlptLevel {
    type Err = PromptError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "N5" => Ok(JlptLevel::N5),
            "N4" => Ok(JlptLevel::N4),
            "N3" => Ok(JlptLevel::N3),
            "N2" => Ok(JlptLevel::N2),
            "N1" => Ok(JlptLevel::N1),
            _ => Err(PromptError::UnknownLevel(s.to_string())),
        }
    }
}

/// Maps a level key to its built-in system prompt. Unknown or missing keys get
/// [`DEFAULT_PROMPT`].
pub fn select_system_prompt(level: Option<&str>) -> &'static str {
    level
        .and_then(|key| key.parse::<JlptLevel>().ok())
        .map(|level| level.builtin_prompt())
        .unwrap_or(DEFAULT_PROMPT)
}

#[derive(Debug, Error)]
pub enum PromptError {
    #[error("Unknown JLPT level '{0}'")]
    UnknownLevel(String),
    #[error("Prompt for '{0}' is empty")]
    EmptyPrompt(String),
    #[error("Prompt file IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Prompt JSON parsing error: {0}")]
    JsonError(#[from] serde_json::Error),
}

#[derive(Deserialize, Debug, Default)]
struct PromptFile {
    #[serde(default)]
    default: Option<String>,
    #[serde(default)]
    levels: HashMap<String, String>,
}

/// The level to prompt table in effect: built-ins, optionally overridden from a file.
#[derive(Debug, Clone)]
pub struct PromptBook {
    default: String,
    levels: HashMap<JlptLevel, String>,
    pub last_loaded: Option<SystemTime>,
}

impl Default for PromptBook {
    fn default() -> Self {
        Self {
            default: DEFAULT_PROMPT.to_string(),
            levels: JlptLevel::ALL
                .iter()
                .map(|level| (*level, level.builtin_prompt().to_string()))
                .collect(),
            last_loaded: None,
        }
    }
}

impl PromptBook {
    pub fn from_json(json: &str) -> Result<Self, PromptError> {
        let file: PromptFile = serde_json::from_str(json)?;
        let mut book = PromptBook::default();

        if let Some(default) = file.default {
            if default.trim().is_empty() {
                return Err(PromptError::EmptyPrompt("default".to_string()));
            }
            book.default = default;
        }
        for (key, prompt) in file.levels {
            let level: JlptLevel = key.parse()?;
            if prompt.trim().is_empty() {
                return Err(PromptError::EmptyPrompt(key));
            }
            book.levels.insert(level, prompt);
        }
        Ok(book)
    }

    pub fn select(&self, level: Option<&str>) -> &str {
        level
            .and_then(|key| key.parse::<JlptLevel>().ok())
            .and_then(|level| self.levels.get(&level))
            .map(String::as_str)
            .unwrap_or(&self.default)
    }

    pub fn default_prompt(&self) -> &str {
        &self.default
    }
}

pub fn load_prompts<P: AsRef<Path>>(path: P) -> Result<Arc<PromptBook>, PromptError> {
    let modified = fs::metadata(path.as_ref())?.modified().ok();
    let file_content = fs::read_to_string(path.as_ref())?;
    let mut book = PromptBook::from_json(&file_content)?;
    book.last_loaded = modified;
    Ok(Arc::new(book))
}

pub fn reload_prompts_if_changed<P: AsRef<Path>>(
    path: P,
    current: &Arc<PromptBook>
) -> Result<Option<Arc<PromptBook>>, PromptError> {
    let metadata = fs::metadata(&path)?;

    if let Ok(modified) = metadata.modified() {
        match current.last_loaded {
            Some(last_loaded) if modified == last_loaded => {}
            Some(_) => {
                info!("Prompts file changed, reloading...");
                return load_prompts(path).map(Some);
            }
            None => {
                info!("No last_loaded timestamp, reloading prompts...");
                return load_prompts(path).map(Some);
            }
        }
    }
    Ok(None)
}

/// Holds the current prompt book and swaps it when the backing file changes.
#[derive(Debug)]
pub struct PromptStore {
    path: Option<PathBuf>,
    current: RwLock<Arc<PromptBook>>,
}

impl PromptStore {
    pub fn builtin() -> Self {
        Self {
            path: None,
            current: RwLock::new(Arc::new(PromptBook::default())),
        }
    }

    pub fn from_path(path: impl Into<PathBuf>) -> Result<Self, PromptError> {
        let path = path.into();
        let book = load_prompts(&path)?;
        info!("Loaded prompts from '{}'", path.display());
        Ok(Self {
            path: Some(path),
            current: RwLock::new(book),
        })
    }

    pub fn snapshot(&self) -> Arc<PromptBook> {
        match self.current.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    /// Returns `Ok(true)` when a newer file was loaded. A store without a file
    /// never reloads.
    pub fn reload_if_changed(&self) -> Result<bool, PromptError> {
        let Some(path) = &self.path else {
            return Ok(false);
        };
        let current = self.snapshot();
        match reload_prompts_if_changed(path, &current)? {
            Some(book) => {
                match self.current.write() {
                    Ok(mut guard) => {
                        *guard = book;
                    }
                    Err(poisoned) => {
                        warn!("Prompt store lock was poisoned, replacing contents");
                        *poisoned.into_inner() = book;
                    }
                }
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::time::Duration;
    use uuid::Uuid;

    #[test]
    fn every_level_has_a_distinct_prompt() {
        let prompts: HashSet<&str> = JlptLevel::ALL
            .iter()
            .map(|level| select_system_prompt(Some(level.as_str())))
            .collect();

        assert_eq!(prompts.len(), 5);
        assert!(prompts.iter().all(|p| !p.is_empty()));
        assert!(!prompts.contains(DEFAULT_PROMPT));
    }

    #[test]
    fn unknown_keys_fall_back_to_default() {
        assert_eq!(select_system_prompt(None), DEFAULT_PROMPT);
        assert_eq!(select_system_prompt(Some("N6")), DEFAULT_PROMPT);
        assert_eq!(select_system_prompt(Some("")), DEFAULT_PROMPT);
        assert_eq!(select_system_prompt(Some("beginner")), DEFAULT_PROMPT);
    }

    #[test]
    fn keys_are_case_insensitive() {
        assert_eq!(select_system_prompt(Some(" n5 ")), N5_PROMPT);
        assert_eq!(select_system_prompt(Some("N1")), N1_PROMPT);
    }

    #[test]
    fn levels_are_ordered_beginner_to_advanced() {
        assert!(JlptLevel::N5 < JlptLevel::N1);
        assert_eq!(JlptLevel::ALL.first(), Some(&JlptLevel::N5));
    }

    #[test]
    fn file_overrides_merge_with_builtins() {
        let book = PromptBook::from_json(
            r#"{"default": "Be brief.", "levels": {"n3": "Custom N3 prompt"}}"#
        ).unwrap();

        assert_eq!(book.select(Some("N3")), "Custom N3 prompt");
        assert_eq!(book.select(Some("N5")), N5_PROMPT);
        assert_eq!(book.select(Some("N9")), "Be brief.");
        assert_eq!(book.select(None), "Be brief.");
    }

    #[test]
    fn rejects_unknown_or_empty_entries() {
        assert!(matches!(
            PromptBook::from_json(r#"{"levels": {"N0": "x"}}"#),
            Err(PromptError::UnknownLevel(_))
        ));
        assert!(matches!(
            PromptBook::from_json(r#"{"levels": {"N2": "  "}}"#),
            Err(PromptError::EmptyPrompt(_))
        ));
    }

    fn write_with_mtime(path: &Path, contents: &str, mtime: SystemTime) {
        fs::write(path, contents).unwrap();
        let file = fs::File::options().write(true).open(path).unwrap();
        file.set_modified(mtime).unwrap();
    }

    #[test]
    fn store_reloads_when_file_mtime_moves() {
        let path = std::env::temp_dir().join(format!("prompts-{}.json", Uuid::new_v4()));
        let t0 = SystemTime::now() - Duration::from_secs(60);
        write_with_mtime(&path, r#"{"levels": {"N4": "first"}}"#, t0);

        let store = PromptStore::from_path(&path).unwrap();
        assert_eq!(store.snapshot().select(Some("N4")), "first");
        assert!(!store.reload_if_changed().unwrap());

        // Still older than the moment the store loaded the file.
        write_with_mtime(&path, r#"{"levels": {"N4": "second"}}"#, t0 + Duration::from_secs(30));

        assert!(store.reload_if_changed().unwrap());
        assert_eq!(store.snapshot().select(Some("N4")), "second");
        assert!(!store.reload_if_changed().unwrap());

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn builtin_store_never_reloads() {
        let store = PromptStore::builtin();
        assert!(!store.reload_if_changed().unwrap());
        assert_eq!(store.snapshot().select(Some("N2")), N2_PROMPT);
    }
}
