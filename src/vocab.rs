//! Vocabulary and Merge-Rank Tables
//!
//! A pretrained byte-level BPE tokenizer is defined by two files:
//!
//! - **`encoder.json`**: a JSON object mapping each token string to its id
//!   (`{"!": 0, "\"": 1, ..., "Ġthe": 262, ...}`)
//! - **`vocab.bpe`**: the merge rules, one `"left right"` pair per line in
//!   priority order. The first line is a version header and the file ends with
//!   a newline, so the first and last lines are not rules.
//!
//! Both tables are read once and never modified afterwards.

use crate::error::{Error, FormatError, Result};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

/// Token string ↔ integer id mapping
#[derive(Clone, Debug, Default)]
pub struct Vocabulary {
    token_to_id: HashMap<String, usize>,
    id_to_token: HashMap<usize, String>,
}

impl Vocabulary {
    /// Build a vocabulary from `(token, id)` pairs
    ///
    /// If a token appears twice, the later id wins.
    pub fn from_entries<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = (S, usize)>,
        S: Into<String>,
    {
        let mut token_to_id = HashMap::new();
        for (token, id) in entries {
            token_to_id.insert(token.into(), id);
        }
        let id_to_token = token_to_id
            .iter()
            .map(|(token, &id)| (id, token.clone()))
            .collect();

        Self {
            token_to_id,
            id_to_token,
        }
    }

    /// Load a vocabulary from a JSON object file
    ///
    /// # Arguments
    ///
    /// * `path` - Path to `encoder.json`
    ///
    /// # Returns
    ///
    /// The vocabulary, or an error if the file is missing or not a
    /// `{string: integer}` object
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let json = fs::read_to_string(path).map_err(|source| Error::Open {
            path: path.to_path_buf(),
            source,
        })?;
        let entries: HashMap<String, usize> =
            serde_json::from_str(&json).map_err(|source| Error::Json {
                path: path.to_path_buf(),
                source,
            })?;

        log::debug!("loaded {} vocabulary entries from {}", entries.len(), path.display());
        Ok(Self::from_entries(entries))
    }

    /// Id of `token`, if present
    pub fn id(&self, token: &str) -> Option<usize> {
        self.token_to_id.get(token).copied()
    }

    /// Token string for `id`, if present
    pub fn token(&self, id: usize) -> Option<&str> {
        self.id_to_token.get(&id).map(String::as_str)
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.token_to_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.token_to_id.is_empty()
    }
}

/// Priority of each mergeable token pair
///
/// Lower rank merges earlier. Pairs that are not in the table never merge.
#[derive(Clone, Debug, Default)]
pub struct MergeRanks {
    // left -> right -> rank, so lookups borrow both halves without allocating
    ranks: HashMap<String, HashMap<String, usize>>,
    len: usize,
}

impl MergeRanks {
    /// Build a table from pairs in priority order
    ///
    /// The position of each pair is its rank. A repeated pair keeps the rank of
    /// its first occurrence.
    ///
    /// # Example
    ///
    /// ```rust
    /// # use gpt2_lazy::MergeRanks;
    /// let ranks = MergeRanks::from_pairs([("a", "b"), ("b", "c")]);
    /// assert_eq!(ranks.rank("a", "b"), Some(0));
    /// assert_eq!(ranks.rank("b", "c"), Some(1));
    /// assert_eq!(ranks.rank("c", "a"), None);
    /// ```
    pub fn from_pairs<I, A, B>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (A, B)>,
        A: AsRef<str>,
        B: AsRef<str>,
    {
        let mut ranks: HashMap<String, HashMap<String, usize>> = HashMap::new();
        let mut len = 0;
        for (rank, (left, right)) in pairs.into_iter().enumerate() {
            let rights = ranks.entry(left.as_ref().to_string()).or_default();
            if !rights.contains_key(right.as_ref()) {
                rights.insert(right.as_ref().to_string(), rank);
                len += 1;
            }
        }
        Self { ranks, len }
    }

    /// Parse the text of a merge file
    ///
    /// The first and last lines are skipped; every line between them must hold
    /// exactly two whitespace-separated tokens.
    pub fn parse(text: &str) -> Result<Self> {
        let lines: Vec<&str> = text.split('\n').collect();
        let interior = if lines.len() >= 2 {
            &lines[1..lines.len() - 1]
        } else {
            &[][..]
        };

        let mut pairs = Vec::with_capacity(interior.len());
        for (i, line) in interior.iter().enumerate() {
            let line = line.trim_end_matches('\r');
            let mut parts = line.split_whitespace();
            match (parts.next(), parts.next(), parts.next()) {
                (Some(left), Some(right), None) => pairs.push((left, right)),
                _ => {
                    return Err(FormatError::MergeLine {
                        // 1-based line number in the file
                        line: i + 2,
                        content: line.to_string(),
                    }
                    .into())
                }
            }
        }

        Ok(Self::from_pairs(pairs))
    }

    /// Load a merge file from disk
    ///
    /// # Arguments
    ///
    /// * `path` - Path to `vocab.bpe`
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| Error::Open {
            path: path.to_path_buf(),
            source,
        })?;
        let ranks = Self::parse(&text)?;
        log::debug!("loaded {} merge rules from {}", ranks.len(), path.display());
        Ok(ranks)
    }

    /// Rank of the pair `(left, right)`, if it may merge
    pub fn rank(&self, left: &str, right: &str) -> Option<usize> {
        self.ranks.get(left)?.get(right).copied()
    }

    /// Number of merge rules
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}
