use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use crate::error::{Result, TokenizerError};

/// Two-way token/id map. Ids are kept ordered so `vocab.json` is written in
/// id order, the layout Hugging Face tokenizers produce.
#[derive(Debug, Clone, Default)]
pub struct Vocab {
    token_to_id: HashMap<String, u32>,
    id_to_token: BTreeMap<u32, String>,
}

impl Vocab {
    pub fn new() -> Self {
        Self::default()
    }

    /// Maps `token` to `id`, dropping whatever either side pointed at before.
    pub fn insert(&mut self, token: String, id: u32) {
        if let Some(old_id) = self.token_to_id.insert(token.clone(), id) {
            if old_id != id {
                self.id_to_token.remove(&old_id);
            }
        }
        if let Some(old_token) = self.id_to_token.insert(id, token.clone()) {
            if old_token != token {
                self.token_to_id.remove(&old_token);
            }
        }
    }

    pub fn get_id(&self, token: &str) -> Option<u32> {
        self.token_to_id.get(token).copied()
    }

    pub fn get_token(&self, id: u32) -> Option<&str> {
        self.id_to_token.get(&id).map(String::as_str)
    }

    /// Smallest id above every assigned id; ids may be sparse after added tokens.
    pub fn next_id(&self) -> u32 {
        self.id_to_token.keys().next_back().map_or(0, |&id| id + 1)
    }

    pub fn len(&self) -> usize {
        self.token_to_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.token_to_id.is_empty()
    }

    /// Writes `{"token": id, ...}` in id order.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(writer, &ById(&self.id_to_token))?;
        Ok(())
    }

    /// Reads a `vocab.json`. Two tokens sharing an id is an error.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let reader = BufReader::new(File::open(path)?);
        let token_to_id: HashMap<String, u32> = serde_json::from_reader(reader)?;

        let mut id_to_token = BTreeMap::new();
        for (token, &id) in &token_to_id {
            if let Some(other) = id_to_token.insert(id, token.clone()) {
                return Err(TokenizerError::DuplicateId { id, first: other, second: token.clone() });
            }
        }
        Ok(Self { token_to_id, id_to_token })
    }
}

struct ById<'a>(&'a BTreeMap<u32, String>);

impl Serialize for ById<'_> {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_map(self.0.iter().map(|(id, token)| (token, id)))
    }
}
