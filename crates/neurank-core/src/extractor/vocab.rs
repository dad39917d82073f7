//! Token vocabulary with reserved padding and unknown ids.

use std::collections::HashMap;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{RerankError, RerankResult};

/// Padding id.
pub const PAD_ID: u32 = 0;
/// Unknown-token id.
pub const UNK_ID: u32 = 1;
/// Padding token.
pub const PAD_TOKEN: &str = "<pad>";
/// Unknown token.
pub const UNK_TOKEN: &str = "<unk>";

/// Bidirectional token ↔ id map.
///
/// Ids are dense and assigned in insertion order after the two reserved
/// entries. Once frozen, no token can be added.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Vocabulary {
    itos: Vec<String>,
    stoi: HashMap<String, u32>,
    frozen: bool,
}

impl Default for Vocabulary {
    fn default() -> Self {
        Self::new()
    }
}

impl Vocabulary {
    /// Vocabulary holding only `<pad>` and `<unk>`.
    pub fn new() -> Self {
        let itos = vec![PAD_TOKEN.to_string(), UNK_TOKEN.to_string()];
        let stoi = itos
            .iter()
            .enumerate()
            .map(|(i, t)| (t.clone(), i as u32))
            .collect();
        Self {
            itos,
            stoi,
            frozen: false,
        }
    }

    /// Add a token, returning its id. Known tokens keep their id.
    ///
    /// # Errors
    /// - `RerankError::ConfigError` if the vocabulary is frozen
    pub fn add(&mut self, token: &str) -> RerankResult<u32> {
        if let Some(id) = self.stoi.get(token) {
            return Ok(*id);
        }
        if self.frozen {
            return Err(RerankError::config(format!(
                "cannot add '{}' to a frozen vocabulary",
                token
            )));
        }
        let id = self.itos.len() as u32;
        self.itos.push(token.to_string());
        self.stoi.insert(token.to_string(), id);
        Ok(id)
    }

    /// Add every token of a sequence in order.
    pub fn extend<'a>(&mut self, tokens: impl IntoIterator<Item = &'a str>) -> RerankResult<()> {
        for token in tokens {
            self.add(token)?;
        }
        Ok(())
    }

    /// Disallow further additions.
    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Id of a token, [`UNK_ID`] when absent.
    pub fn id(&self, token: &str) -> u32 {
        self.stoi.get(token).copied().unwrap_or(UNK_ID)
    }

    /// Whether a token has its own id.
    pub fn contains(&self, token: &str) -> bool {
        self.stoi.contains_key(token)
    }

    /// Token of an id.
    pub fn token(&self, id: u32) -> Option<&str> {
        self.itos.get(id as usize).map(String::as_str)
    }

    /// Tokens in id order.
    pub fn tokens(&self) -> &[String] {
        &self.itos
    }

    pub fn len(&self) -> usize {
        self.itos.len()
    }

    /// Always false: the reserved entries are present.
    pub fn is_empty(&self) -> bool {
        self.itos.is_empty()
    }
}

impl Serialize for Vocabulary {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.itos.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Vocabulary {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let itos = Vec::<String>::deserialize(deserializer)?;
        if itos.get(PAD_ID as usize).map(String::as_str) != Some(PAD_TOKEN)
            || itos.get(UNK_ID as usize).map(String::as_str) != Some(UNK_TOKEN)
        {
            return Err(serde::de::Error::custom(
                "vocabulary must start with <pad> and <unk>",
            ));
        }
        let stoi = itos
            .iter()
            .enumerate()
            .map(|(i, t)| (t.clone(), i as u32))
            .collect();
        Ok(Self {
            itos,
            stoi,
            frozen: true,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserved_ids() {
        let vocab = Vocabulary::new();
        assert_eq!(vocab.len(), 2);
        assert_eq!(vocab.id(PAD_TOKEN), PAD_ID);
        assert_eq!(vocab.id(UNK_TOKEN), UNK_ID);
        assert_eq!(vocab.id("missing"), UNK_ID);
    }

    #[test]
    fn test_insertion_order_and_freeze() {
        let mut vocab = Vocabulary::new();
        vocab.extend(["dummy", "doc", "dummy"]).unwrap();
        assert_eq!(vocab.id("dummy"), 2);
        assert_eq!(vocab.id("doc"), 3);
        assert_eq!(vocab.token(3), Some("doc"));

        vocab.freeze();
        assert_eq!(vocab.add("dummy").unwrap(), 2);
        assert!(vocab.add("new").is_err());
    }

    #[test]
    fn test_json_round_trip_is_frozen() {
        let mut vocab = Vocabulary::new();
        vocab.extend(["a", "b"]).unwrap();
        let json = serde_json::to_string(&vocab).unwrap();
        assert_eq!(json, r#"["<pad>","<unk>","a","b"]"#);

        let back: Vocabulary = serde_json::from_str(&json).unwrap();
        assert!(back.is_frozen());
        assert_eq!(back.id("b"), 3);

        assert!(serde_json::from_str::<Vocabulary>(r#"["a","b"]"#).is_err());
    }
}
