use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use crate::byte_level;
use crate::error::{Result, TokenizerError};
use crate::vocab::Vocab;
use crate::Tokenize;

pub const VOCAB_FILENAME: &str = "vocab.json";
pub const MERGES_FILENAME: &str = "merges.txt";
pub const TOKENIZER_CONFIG_FILENAME: &str = "tokenizer_config.json";

/// GPT-2 style pre-tokenization, minus the `\s+(?!\S)` lookahead the regex
/// crate lacks. Good enough for tokenizers trained here; vocabularies trained
/// elsewhere go through [`crate::HfTokenizer`].
pub const GPT2_PATTERN: &str = r"'s|'t|'re|'ve|'m|'ll|'d| ?\p{L}+| ?\p{N}+| ?[^\s\p{L}\p{N}]+|\s+";

const BYTE_LEVEL_CLASSES: [&str; 2] = ["GPT2Tokenizer", "GPT2TokenizerFast"];

/// Slow-format BPE over `vocab.json` + `merges.txt`.
#[derive(Clone)]
pub struct BPE {
    pub vocab: Vocab,
    pub merges: HashMap<(String, String), u32>,
    /// Whether symbols are GPT-2 byte stand-ins rather than characters.
    pub byte_level: bool,
    /// Tokens that are matched verbatim before pre-tokenization and skipped
    /// when decoding.
    pub special_tokens: Vec<String>,
    pub eos_token: Option<String>,
    pub pad_token: Option<String>,
    pub pattern: String,
    regex: Regex,
    special_regex: Option<Regex>,
}

fn default_regex() -> Regex {
    Regex::new(GPT2_PATTERN).expect("static GPT-2 pattern is valid")
}

// Custom Debug impl to skip regex
impl std::fmt::Debug for BPE {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BPE")
            .field("vocab_size", &self.vocab.len())
            .field("merges_count", &self.merges.len())
            .field("byte_level", &self.byte_level)
            .field("special_tokens", &self.special_tokens)
            .finish()
    }
}

impl BPE {
    pub fn new(vocab: Vocab, merges: HashMap<(String, String), u32>) -> Self {
        Self {
            vocab,
            merges,
            byte_level: false,
            special_tokens: Vec::new(),
            eos_token: None,
            pad_token: None,
            pattern: GPT2_PATTERN.to_string(),
            regex: default_regex(),
            special_regex: None,
        }
    }

    pub fn with_byte_level(mut self, byte_level: bool) -> Self {
        self.byte_level = byte_level;
        self
    }

    /// Registers `token` as special, assigning the next free id if the vocab
    /// does not already contain it.
    pub fn add_special_token(&mut self, token: &str) -> u32 {
        let id = match self.vocab.get_id(token) {
            Some(id) => id,
            None => {
                let id = self.vocab.next_id();
                self.vocab.insert(token.to_string(), id);
                id
            }
        };
        if !self.special_tokens.iter().any(|t| t == token) {
            self.special_tokens.push(token.to_string());
            self.rebuild_special_regex();
        }
        id
    }

    pub fn set_eos_token(&mut self, token: &str) -> u32 {
        let id = self.add_special_token(token);
        self.eos_token = Some(token.to_string());
        id
    }

    pub fn set_pad_token(&mut self, token: &str) -> u32 {
        let id = self.add_special_token(token);
        self.pad_token = Some(token.to_string());
        id
    }

    fn rebuild_special_regex(&mut self) {
        if self.special_tokens.is_empty() {
            self.special_regex = None;
            return;
        }
        let mut tokens: Vec<&String> = self.special_tokens.iter().collect();
        // longest first so overlapping specials prefer the full match
        tokens.sort_by_key(|t| std::cmp::Reverse(t.len()));
        let alternation = tokens.iter().map(|t| regex::escape(t)).collect::<Vec<_>>().join("|");
        self.special_regex = Regex::new(&alternation).ok();
    }

    pub fn from_files<P: AsRef<Path>>(vocab_path: P, merges_path: P) -> Result<Self> {
        let vocab = Vocab::load(vocab_path)?;

        let file = File::open(merges_path)?;
        let reader = BufReader::new(file);
        let mut merges = HashMap::new();

        for (i, line_res) in reader.lines().enumerate() {
            let line = line_res?;
            if line.starts_with('#') || line.trim().is_empty() {
                continue;
            }

            let parts: Vec<&str> = line.split(' ').collect();
            if parts.len() != 2 {
                return Err(TokenizerError::MalformedMerge { line: i + 1, content: line });
            }
            merges.insert((parts[0].to_string(), parts[1].to_string()), i as u32);
        }

        Ok(Self::new(vocab, merges))
    }

    /// Loads `vocab.json` + `merges.txt` (+ optional `tokenizer_config.json`)
    /// from a model directory in the Hugging Face layout.
    pub fn from_pretrained<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref();
        let mut bpe = Self::from_files(dir.join(VOCAB_FILENAME), dir.join(MERGES_FILENAME))?;

        let config_path = dir.join(TOKENIZER_CONFIG_FILENAME);
        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            let config: serde_json::Value = serde_json::from_str(&content)?;
            bpe.apply_tokenizer_config(&config)?;
        }
        tracing::debug!(tokenizer = ?bpe, "loaded tokenizer");
        Ok(bpe)
    }

    fn apply_tokenizer_config(&mut self, config: &serde_json::Value) -> Result<()> {
        let class = config.get("tokenizer_class").and_then(|c| c.as_str()).unwrap_or_default();
        let byte_level = config
            .get("byte_level")
            .and_then(|b| b.as_bool())
            .unwrap_or_else(|| BYTE_LEVEL_CLASSES.contains(&class));
        self.byte_level = byte_level;

        if let Some(pattern) = config.get("pattern").and_then(|p| p.as_str()) {
            self.regex = Regex::new(pattern)?;
            self.pattern = pattern.to_string();
        }

        if let Some(added) = config.get("added_tokens_decoder").and_then(|a| a.as_object()) {
            let mut added: Vec<(u32, &serde_json::Value)> = added
                .iter()
                .filter_map(|(id, entry)| id.parse().ok().map(|id| (id, entry)))
                .collect();
            added.sort_by_key(|(id, _)| *id);
            for (id, entry) in added {
                if let Some(content) = entry.get("content").and_then(|c| c.as_str()) {
                    self.vocab.insert(content.to_string(), id);
                    if entry.get("special").and_then(|s| s.as_bool()).unwrap_or(true) {
                        self.add_special_token(content);
                    }
                }
            }
        }

        if let Some(eos) = token_field(config, "eos_token") {
            self.set_eos_token(&eos);
        }
        if let Some(pad) = token_field(config, "pad_token") {
            self.set_pad_token(&pad);
        }
        Ok(())
    }

    /// Writes `vocab.json`, `merges.txt` and `tokenizer_config.json` into `dir`.
    pub fn save_pretrained<P: AsRef<Path>>(&self, dir: P) -> Result<()> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        self.vocab.save(dir.join(VOCAB_FILENAME))?;

        let mut file = BufWriter::new(File::create(dir.join(MERGES_FILENAME))?);
        writeln!(file, "#version: 0.2")?;
        // ranks are line numbers on load, so write in rank order
        let mut sorted_merges: Vec<_> = self.merges.iter().collect();
        sorted_merges.sort_by_key(|&(_, rank)| rank);
        for ((p1, p2), _) in sorted_merges {
            writeln!(file, "{} {}", p1, p2)?;
        }
        file.flush()?;

        let added: serde_json::Map<String, serde_json::Value> = self
            .special_tokens
            .iter()
            .filter_map(|t| self.vocab.get_id(t).map(|id| (id.to_string(), serde_json::json!({ "content": t, "special": true }))))
            .collect();
        let config = serde_json::json!({
            "byte_level": self.byte_level,
            "pattern": self.pattern,
            "eos_token": self.eos_token,
            "pad_token": self.pad_token,
            "added_tokens_decoder": added,
        });
        std::fs::write(dir.join(TOKENIZER_CONFIG_FILENAME), serde_json::to_string_pretty(&config)?)?;
        Ok(())
    }

    fn get_pairs(word: &[String]) -> HashSet<(String, String)> {
        let mut pairs = HashSet::new();
        if word.len() < 2 {
            return pairs;
        }
        for i in 0..word.len() - 1 {
            pairs.insert((word[i].clone(), word[i + 1].clone()));
        }
        pairs
    }

    fn bpe(&self, token: &str) -> Vec<String> {
        let mut word: Vec<String> = token.chars().map(|c| c.to_string()).collect();

        loop {
            let pairs = Self::get_pairs(&word);
            let best_pair = pairs
                .into_iter()
                .filter_map(|pair| self.merges.get(&pair).map(|&rank| (rank, pair)))
                .min_by_key(|(rank, _)| *rank);

            let Some((_, (first, second))) = best_pair else {
                break;
            };

            let mut new_word = Vec::with_capacity(word.len());
            let mut i = 0;
            while i < word.len() {
                if i < word.len() - 1 && word[i] == first && word[i + 1] == second {
                    new_word.push(format!("{}{}", first, second));
                    i += 2;
                } else {
                    new_word.push(word[i].clone());
                    i += 1;
                }
            }

            word = new_word;
            if word.len() == 1 {
                break;
            }
        }

        word
    }

    fn encode_ordinary(&self, text: &str, ids: &mut Vec<u32>) {
        for mat in self.regex.find_iter(text) {
            let piece = if self.byte_level {
                byte_level::encode(mat.as_str())
            } else {
                mat.as_str().to_string()
            };

            for token in self.bpe(&piece) {
                if let Some(id) = self.vocab.get_id(&token) {
                    ids.push(id);
                    continue;
                }
                if self.byte_level {
                    // incomplete vocab: fall back to single symbols
                    ids.extend(token.chars().filter_map(|c| self.vocab.get_id(&c.to_string())));
                    continue;
                }
                for byte in token.bytes() {
                    let s = format!("<0x{:02X}>", byte);
                    if let Some(id) = self.vocab.get_id(&s) {
                        ids.push(id);
                    } else if let Some(id) = self.vocab.get_id("<UNK>") {
                        ids.push(id);
                    }
                }
            }
        }
    }

    pub fn encode(&self, text: &str) -> Vec<u32> {
        let mut ids = Vec::new();
        let Some(special) = &self.special_regex else {
            self.encode_ordinary(text, &mut ids);
            return ids;
        };

        let mut last = 0;
        for mat in special.find_iter(text) {
            self.encode_ordinary(&text[last..mat.start()], &mut ids);
            if let Some(id) = self.vocab.get_id(mat.as_str()) {
                ids.push(id);
            }
            last = mat.end();
        }
        self.encode_ordinary(&text[last..], &mut ids);
        ids
    }

    /// Decodes ids back to text, skipping special tokens.
    pub fn decode(&self, ids: &[u32]) -> String {
        let mut bytes = Vec::new();
        for id in ids {
            let Some(token) = self.vocab.get_token(*id) else {
                continue;
            };
            if self.is_special(token) {
                continue;
            }
            if self.byte_level {
                bytes.extend(byte_level::decode(token).into_bytes());
            } else if let Some(byte) = parse_byte_token(token) {
                bytes.push(byte);
            } else {
                bytes.extend_from_slice(token.as_bytes());
            }
        }
        String::from_utf8_lossy(&bytes).into_owned()
    }

    fn is_special(&self, token: &str) -> bool {
        self.special_tokens.iter().any(|t| t == token)
    }
}

impl Tokenize for BPE {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        Ok(BPE::encode(self, text))
    }

    fn decode(&self, ids: &[u32]) -> Result<String> {
        Ok(BPE::decode(self, ids))
    }

    fn eos_token_id(&self) -> Option<u32> {
        self.eos_token.as_deref().and_then(|t| self.vocab.get_id(t))
    }

    fn pad_token_id(&self) -> Option<u32> {
        self.pad_token
            .as_deref()
            .and_then(|t| self.vocab.get_id(t))
            .or_else(|| self.eos_token_id())
    }

    fn vocab_size(&self) -> usize {
        self.vocab.next_id() as usize
    }
}

/// `eos_token` / `pad_token` may be a plain string or `{ "content": ... }`.
pub(crate) fn token_field(config: &serde_json::Value, key: &str) -> Option<String> {
    match config.get(key)? {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Object(o) => o.get("content").and_then(|c| c.as_str()).map(str::to_string),
        _ => None,
    }
}

fn parse_byte_token(token: &str) -> Option<u8> {
    let hex = token.strip_prefix("<0x")?.strip_suffix('>')?;
    if hex.len() != 2 {
        return None;
    }
    u8::from_str_radix(hex, 16).ok()
}
