//! Prompt token counting.
//!
//! Each model names the BPE encoding its tokenizer uses. Known encodings are
//! counted exactly with `tiktoken-rs`; anything else falls back to a
//! character heuristic (ASCII at ~4 characters per token, every other
//! character as one token).

use std::sync::{LazyLock, Mutex, PoisonError};

use tiktoken_rs::CoreBPE;
use tracing::warn;

/// Per-message overhead for role names and delimiters in the wire format.
const MESSAGE_OVERHEAD: usize = 4;

type Encoding = LazyLock<Option<Mutex<CoreBPE>>>;

static CL100K_BASE: Encoding = LazyLock::new(|| tiktoken_rs::cl100k_base().ok().map(Mutex::new));
static O200K_BASE: Encoding = LazyLock::new(|| tiktoken_rs::o200k_base().ok().map(Mutex::new));
static P50K_BASE: Encoding = LazyLock::new(|| tiktoken_rs::p50k_base().ok().map(Mutex::new));
static R50K_BASE: Encoding = LazyLock::new(|| tiktoken_rs::r50k_base().ok().map(Mutex::new));

fn bpe(encoding: &str) -> Option<&'static Mutex<CoreBPE>> {
    let encoding: &'static Encoding = match encoding {
        "cl100k_base" => &CL100K_BASE,
        "o200k_base" => &O200K_BASE,
        "p50k_base" => &P50K_BASE,
        "r50k_base" => &R50K_BASE,
        _ => return None,
    };
    LazyLock::force(encoding).as_ref()
}

/// Token counter bound to one model's encoding.
#[derive(Clone)]
pub struct Tokenizer {
    encoding: String,
    bpe: Option<&'static Mutex<CoreBPE>>,
}

impl std::fmt::Debug for Tokenizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tokenizer")
            .field("encoding", &self.encoding)
            .field("exact", &self.is_exact())
            .finish()
    }
}

impl Tokenizer {
    pub fn for_encoding(encoding: &str) -> Self {
        let bpe = bpe(encoding);
        if bpe.is_none() {
            warn!(encoding, "Unknown token encoding, estimating prompt size");
        }
        Self {
            encoding: encoding.to_string(),
            bpe,
        }
    }

    pub fn encoding(&self) -> &str {
        &self.encoding
    }

    /// False when counts come from the heuristic.
    pub fn is_exact(&self) -> bool {
        self.bpe.is_some()
    }

    pub fn count(&self, text: &str) -> usize {
        match self.bpe {
            Some(bpe) => bpe
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .encode_with_special_tokens(text)
                .len(),
            None => estimate_tokens(text),
        }
    }

    /// Size of a system + user request. An empty system prompt is not sent
    /// and costs nothing.
    pub fn count_prompt(&self, system: &str, user: &str) -> usize {
        let system_cost = if system.is_empty() {
            0
        } else {
            MESSAGE_OVERHEAD + self.count(system)
        };
        system_cost + MESSAGE_OVERHEAD + self.count(user)
    }
}

/// Heuristic token count. Rounds up.
pub fn estimate_tokens(text: &str) -> usize {
    let (ascii, other) = text
        .chars()
        .fold((0usize, 0usize), |(a, o), c| if c.is_ascii() { (a + 1, o) } else { (a, o + 1) });
    ascii.div_ceil(4) + other
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_string_is_zero() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(Tokenizer::for_encoding("cl100k_base").count(""), 0);
    }

    #[test]
    fn heuristic_counts_ascii_by_four() {
        assert_eq!(estimate_tokens("test"), 1);
        assert_eq!(estimate_tokens("tests"), 2);
    }

    #[test]
    fn heuristic_counts_each_cjk_character() {
        assert_eq!(estimate_tokens("项目编号"), 4);
        assert_eq!(estimate_tokens("id 项目"), 3);
    }

    #[test]
    fn known_encoding_counts_exactly() {
        let tokenizer = Tokenizer::for_encoding("cl100k_base");
        assert!(tokenizer.is_exact());
        assert_eq!(tokenizer.count("hello world"), 2);
    }

    #[test]
    fn cjk_prompt_is_not_undercounted() {
        let tokenizer = Tokenizer::for_encoding("cl100k_base");
        let text = "项目编号是多少".repeat(1000);
        let chars = text.chars().count();

        let tokens = tokenizer.count(&text);
        assert!(tokens >= chars / 2, "{tokens} tokens for {chars} characters");
        assert!(tokens > chars.div_ceil(4) * 2);
    }

    #[test]
    fn unknown_encoding_falls_back_to_heuristic() {
        let tokenizer = Tokenizer::for_encoding("made-up");
        assert!(!tokenizer.is_exact());
        assert_eq!(tokenizer.encoding(), "made-up");
        assert_eq!(tokenizer.count("项目编号"), 4);
    }

    #[test]
    fn prompt_includes_overhead() {
        let tokenizer = Tokenizer::for_encoding("made-up");
        assert_eq!(tokenizer.count_prompt("", "test"), 5);
        assert_eq!(tokenizer.count_prompt("test", "test"), 10);
    }
}
