//! Byte-Level Byte Pair Encoding (BPE) Tokenizer
//!
//! This module converts text to GPT-2 token ids and back, reproducing the
//! reference vocabulary and merge table exactly.
//!
//! ## How Encoding Works
//!
//! 1. **Segment**: split the text into chunks with a fixed pattern
//!    (contractions, letter runs, digit runs, symbol runs, whitespace), each
//!    optionally carrying one leading space
//! 2. **Byte-map**: UTF-8 encode each chunk and replace every byte with its
//!    printable stand-in from [`ByteUnicodeMapping`]
//! 3. **Merge**: start from one token per character and repeatedly merge the
//!    adjacent pair with the lowest rank in the merge table
//! 4. **Look up**: map every final token to its vocabulary id
//!
//! ## Example
//!
//! With merge table `["a b", "b c"]`, the word `abc` starts as `[a, b, c]`.
//! Both `(a, b)` and `(b, c)` are mergeable but `(a, b)` has the lower rank, so
//! the word becomes `[ab, c]`. The pair `(ab, c)` is not in the table, so
//! merging stops there. It never produces `[a, bc]`.
//!
//! ## Decoding
//!
//! Decoding concatenates the token strings, maps each character back to its
//! byte and decodes the bytes as UTF-8. Invalid sequences become U+FFFD, so
//! decoding a single id in the middle of a multi-byte character still returns
//! a string.
//!
//! ## Implementation Notes
//!
//! - **Parallel encoding**: texts above a size threshold are segmented once and
//!   the segments are merged on the Rayon pool. Segments are independent, so
//!   the result is identical to the sequential path.
//! - **Double buffer**: the merge loop rebuilds the word into a second vector
//!   and swaps, instead of removing elements in place.

use crate::byte_unicode::ByteUnicodeMapping;
use crate::error::{Error, Result};
use crate::vocab::{MergeRanks, Vocabulary};
use fancy_regex::Regex;
use rayon::prelude::*;
use std::path::Path;

/// GPT-2 segmentation pattern, alternatives in priority order
pub const GPT2_SPLIT_PATTERN: &str =
    r"'s|'t|'re|'ve|'m|'ll|'d| ?\p{L}+| ?\p{N}+| ?[^\s\p{L}\p{N}]+|\s+(?!\S)|\s+";

/// Texts longer than this many bytes are encoded in parallel
const PARALLEL_THRESHOLD: usize = 200_000;

/// A pretrained byte-level BPE tokenizer
///
/// The tokenizer owns its vocabulary, merge table, byte table and compiled
/// segmentation pattern. None of them change after construction, so one
/// instance can be shared freely across threads.
pub struct BPETokenizer {
    /// Token string ↔ id
    vocab: Vocabulary,
    /// Merge priority per adjacent pair
    merges: MergeRanks,
    /// Byte ↔ printable character table
    bytes: ByteUnicodeMapping,
    /// Compiled [`GPT2_SPLIT_PATTERN`]
    pattern: Regex,
}

impl BPETokenizer {
    /// Create a tokenizer from loaded tables
    ///
    /// # Arguments
    ///
    /// * `vocab` - Token string ↔ id table
    /// * `merges` - Merge-rank table
    pub fn new(vocab: Vocabulary, merges: MergeRanks) -> Result<Self> {
        Ok(Self {
            vocab,
            merges,
            bytes: ByteUnicodeMapping::new(),
            pattern: Regex::new(GPT2_SPLIT_PATTERN)?,
        })
    }

    /// Load a tokenizer from its vocabulary and merge files
    ///
    /// # Arguments
    ///
    /// * `encoder_path` - JSON vocabulary (`encoder.json`)
    /// * `merges_path` - Merge rules (`vocab.bpe`)
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// use gpt2_lazy::BPETokenizer;
    ///
    /// let tokenizer = BPETokenizer::from_files(
    ///     "models/124M/encoder.json",
    ///     "models/124M/vocab.bpe",
    /// )?;
    /// let ids = tokenizer.encode("Hello, world!")?;
    /// assert_eq!(tokenizer.decode(&ids), "Hello, world!");
    /// # Ok::<(), gpt2_lazy::Error>(())
    /// ```
    pub fn from_files<P: AsRef<Path>, Q: AsRef<Path>>(encoder_path: P, merges_path: Q) -> Result<Self> {
        let vocab = Vocabulary::load(encoder_path)?;
        let merges = MergeRanks::load(merges_path)?;
        log::info!(
            "tokenizer ready: {} tokens, {} merges",
            vocab.len(),
            merges.len()
        );
        Self::new(vocab, merges)
    }

    /// Split text into the chunks that are merged independently
    ///
    /// # Example
    ///
    /// ```rust
    /// # use gpt2_lazy::{BPETokenizer, MergeRanks, Vocabulary};
    /// # let tokenizer = BPETokenizer::new(Vocabulary::default(), MergeRanks::default())?;
    /// let chunks = tokenizer.segment("I'm here  now")?;
    /// assert_eq!(chunks, vec!["I", "'m", " here", " ", " now"]);
    /// # Ok::<(), gpt2_lazy::Error>(())
    /// ```
    pub fn segment<'t>(&self, text: &'t str) -> Result<Vec<&'t str>> {
        self.pattern
            .find_iter(text)
            .map(|m| m.map(|m| m.as_str()).map_err(Error::from))
            .collect()
    }

    /// Run the merge loop on one byte-mapped word
    ///
    /// The word starts as one token per character. Each round finds the
    /// adjacent pair with the lowest merge rank and replaces every
    /// non-overlapping occurrence of it, left to right. The loop ends when the
    /// word is a single token or no adjacent pair is in the merge table.
    ///
    /// # Arguments
    ///
    /// * `word` - Token string (already passed through the byte table)
    ///
    /// # Returns
    ///
    /// The merged tokens; empty for an empty word
    pub fn bpe(&self, word: &str) -> Vec<String> {
        let mut tokens: Vec<String> = word.chars().map(String::from).collect();
        // buffer to avoid repeated allocations
        let mut merged = Vec::with_capacity(tokens.len());

        while tokens.len() > 1 {
            // Lowest-ranked adjacent pair; the first occurrence wins ties
            let best = tokens
                .windows(2)
                .filter_map(|pair| {
                    self.merges
                        .rank(&pair[0], &pair[1])
                        .map(|rank| (rank, pair))
                })
                .min_by_key(|(rank, _)| *rank)
                .map(|(_, pair)| (pair[0].clone(), pair[1].clone()));

            let Some((first, second)) = best else {
                break;
            };

            merged.clear();
            let mut i = 0;
            while i < tokens.len() {
                if i + 1 < tokens.len() && tokens[i] == first && tokens[i + 1] == second {
                    merged.push(format!("{}{}", first, second));
                    i += 2;
                } else {
                    merged.push(std::mem::take(&mut tokens[i]));
                    i += 1;
                }
            }
            std::mem::swap(&mut tokens, &mut merged);
        }

        tokens
    }

    /// Encode text to token ids
    ///
    /// # Arguments
    ///
    /// * `text` - Input text
    ///
    /// # Returns
    ///
    /// The token ids, or [`Error::VocabularyMismatch`] if the merge loop produced
    /// a token the vocabulary does not contain. No partial list is returned.
    pub fn encode(&self, text: &str) -> Result<Vec<usize>> {
        let segments = self.segment(text)?;

        if text.len() > PARALLEL_THRESHOLD {
            let encoded: Vec<Vec<usize>> = segments
                .par_iter()
                .map(|segment| self.encode_segment(segment))
                .collect::<Result<_>>()?;
            return Ok(encoded.into_iter().flatten().collect());
        }

        let mut ids = Vec::with_capacity(text.len() / 3);
        for segment in segments {
            ids.extend(self.encode_segment(segment)?);
        }
        Ok(ids)
    }

    /// Encode a single segment: byte-map, merge, look up
    fn encode_segment(&self, segment: &str) -> Result<Vec<usize>> {
        let word = self.bytes.encode(segment.as_bytes());
        self.bpe(&word)
            .into_iter()
            .map(|token| match self.vocab.id(&token) {
                Some(id) => Ok(id),
                None => Err(Error::VocabularyMismatch { token }),
            })
            .collect()
    }

    /// Encode text to token strings instead of ids
    ///
    /// Useful for inspecting how a text is split. Tokens are in their
    /// byte-mapped form (`"Ġworld"`), and are not checked against the
    /// vocabulary.
    pub fn tokenize(&self, text: &str) -> Result<Vec<String>> {
        let mut tokens = Vec::new();
        for segment in self.segment(text)? {
            tokens.extend(self.bpe(&self.bytes.encode(segment.as_bytes())));
        }
        Ok(tokens)
    }

    /// Decode token ids back to text
    ///
    /// Ids that are not in the vocabulary contribute nothing. Byte sequences
    /// that are not valid UTF-8 are replaced with U+FFFD.
    ///
    /// # Arguments
    ///
    /// * `ids` - Token ids to decode
    ///
    /// # Returns
    ///
    /// Decoded text (possibly empty, never an error)
    pub fn decode(&self, ids: &[usize]) -> String {
        let joined: String = ids.iter().filter_map(|&id| self.vocab.token(id)).collect();
        String::from_utf8_lossy(&self.bytes.decode(&joined)).into_owned()
    }

    /// Id of a token string, if present
    pub fn token_to_id(&self, token: &str) -> Option<usize> {
        self.vocab.id(token)
    }

    /// Token string of an id, if present
    pub fn id_to_token(&self, id: usize) -> Option<&str> {
        self.vocab.token(id)
    }

    /// Get the vocabulary size
    pub fn vocab_size(&self) -> usize {
        self.vocab.len()
    }

    /// Get statistics about the tokenizer
    pub fn stats(&self) -> TokenizerStats {
        TokenizerStats {
            vocab_size: self.vocab.len(),
            num_merges: self.merges.len(),
            base_tokens: 256,
        }
    }
}

/// Statistics about a tokenizer's tables
#[derive(Debug)]
pub struct TokenizerStats {
    /// Total vocabulary size
    pub vocab_size: usize,
    /// Number of merge rules
    pub num_merges: usize,
    /// Number of byte-level base tokens (always 256)
    pub base_tokens: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    /// Vocabulary with every byte character (ids 0..256) plus `extra` tokens
    fn byte_level_vocab(extra: &[&str]) -> Vocabulary {
        let map = ByteUnicodeMapping::new();
        let bytes = (0..=255u8).map(|b| (map.encode_byte(b).to_string(), b as usize));
        let merged = extra
            .iter()
            .enumerate()
            .map(|(i, token)| (token.to_string(), 256 + i));
        Vocabulary::from_entries(bytes.chain(merged))
    }

    fn byte_level_tokenizer() -> BPETokenizer {
        BPETokenizer::new(byte_level_vocab(&[]), MergeRanks::default()).unwrap()
    }

    #[test]
    fn test_lower_rank_merges_first() {
        let vocab = Vocabulary::from_entries([("a", 0), ("b", 1), ("c", 2), ("ab", 3), ("bc", 4)]);
        let merges = MergeRanks::from_pairs([("a", "b"), ("b", "c")]);
        let tokenizer = BPETokenizer::new(vocab, merges).unwrap();

        assert_eq!(tokenizer.bpe("abc"), vec!["ab", "c"]);
        assert_eq!(tokenizer.encode("abc").unwrap(), vec![3, 2]);
    }

    #[test]
    fn test_rank_order_beats_position() {
        let merges = MergeRanks::from_pairs([("b", "c"), ("a", "b")]);
        let tokenizer = BPETokenizer::new(Vocabulary::default(), merges).unwrap();
        assert_eq!(tokenizer.bpe("abc"), vec!["a", "bc"]);
    }

    #[test]
    fn test_merges_chain_until_stable() {
        let merges = MergeRanks::from_pairs([("l", "l"), ("h", "e"), ("he", "ll"), ("hell", "o")]);
        let tokenizer = BPETokenizer::new(Vocabulary::default(), merges).unwrap();
        assert_eq!(tokenizer.bpe("hello"), vec!["hello"]);
    }

    #[test]
    fn test_repeated_pair_merges_without_overlap() {
        let merges = MergeRanks::from_pairs([("a", "a")]);
        let tokenizer = BPETokenizer::new(Vocabulary::default(), merges).unwrap();
        assert_eq!(tokenizer.bpe("aaa"), vec!["aa", "a"]);
        assert_eq!(tokenizer.bpe("aaaa"), vec!["aa", "aa"]);
    }

    #[test]
    fn test_unranked_word_stays_split() {
        let tokenizer = byte_level_tokenizer();
        assert_eq!(tokenizer.bpe("xyz"), vec!["x", "y", "z"]);
    }

    #[test]
    fn test_empty_input() {
        let tokenizer = byte_level_tokenizer();
        assert!(tokenizer.bpe("").is_empty());
        assert!(tokenizer.encode("").unwrap().is_empty());
        assert_eq!(tokenizer.decode(&[]), "");
    }

    #[test]
    fn test_segmentation_priority() {
        let tokenizer = byte_level_tokenizer();
        assert_eq!(
            tokenizer.segment("I'm here  now\n").unwrap(),
            vec!["I", "'m", " here", " ", " now", "\n"]
        );
        assert_eq!(
            tokenizer.segment("they'll pay 42 dollars!!").unwrap(),
            vec!["they", "'ll", " pay", " 42", " dollars", "!!"]
        );
        assert_eq!(tokenizer.segment("abc123").unwrap(), vec!["abc", "123"]);
    }

    #[test]
    fn test_segmentation_trailing_whitespace() {
        let tokenizer = byte_level_tokenizer();
        assert_eq!(tokenizer.segment("a \t ").unwrap(), vec!["a", " \t "]);
    }

    #[test]
    fn test_byte_order_mark_is_not_whitespace() {
        let tokenizer = byte_level_tokenizer();
        assert_eq!(
            tokenizer.segment("a \u{feff}b").unwrap(),
            vec!["a", " \u{feff}", "b"]
        );
    }

    #[test]
    fn test_tokenizer_is_shared_across_threads() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<BPETokenizer>();

        let tokenizer = byte_level_tokenizer();
        let texts = ["hello world", "the cat sat", "42 dollars!!"];
        std::thread::scope(|scope| {
            let handles: Vec<_> = texts
                .iter()
                .map(|text| {
                    let tokenizer = &tokenizer;
                    scope.spawn(move || tokenizer.encode(text).unwrap())
                })
                .collect();
            for (handle, text) in handles.into_iter().zip(texts) {
                let ids = handle.join().unwrap();
                assert_eq!(tokenizer.decode(&ids), text);
            }
        });
    }

    #[test]
    fn test_leading_space_is_byte_mapped() {
        let tokenizer = byte_level_tokenizer();
        assert_eq!(tokenizer.tokenize(" hi").unwrap(), vec!["Ġ", "h", "i"]);
    }

    #[test]
    fn test_gpt2_style_merge_with_space_marker() {
        let vocab = byte_level_vocab(&["Ġt", "he", "Ġthe"]);
        let merges = MergeRanks::from_pairs([("Ġ", "t"), ("h", "e"), ("Ġt", "he")]);
        let tokenizer = BPETokenizer::new(vocab, merges).unwrap();

        let ids = tokenizer.encode("the the").unwrap();
        // "the" has no leading space, so only "he" merges; " the" merges fully
        assert_eq!(ids, vec![b't' as usize, 257, 258]);
        assert_eq!(tokenizer.decode(&ids), "the the");
    }

    #[test]
    fn test_missing_token_is_fatal() {
        let vocab = Vocabulary::from_entries([("a", 0), ("b", 1)]);
        let merges = MergeRanks::from_pairs([("a", "b")]);
        let tokenizer = BPETokenizer::new(vocab, merges).unwrap();

        let err = tokenizer.encode("ab").unwrap_err();
        match err {
            Error::VocabularyMismatch { token } => assert_eq!(token, "ab"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_missing_token_after_valid_prefix_returns_no_ids() {
        let vocab = Vocabulary::from_entries([("a", 0)]);
        let tokenizer = BPETokenizer::new(vocab, MergeRanks::default()).unwrap();
        assert!(tokenizer.encode("a a z").is_err());
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let tokenizer = byte_level_tokenizer();
        let test_cases = vec![
            "hello",
            "Hello, world!",
            "To be, or not to be",
            "123 456 789",
            "special chars: !@#$%^&*()",
            "newline\nand\ttab",
            "UTF-8: café, naïve, 日本語",
        ];

        for text in test_cases {
            let encoded = tokenizer.encode(text).unwrap();
            assert_eq!(tokenizer.decode(&encoded), text, "Failed roundtrip for: {}", text);
        }
    }

    #[test]
    fn test_decode_partial_utf8_is_replaced() {
        let tokenizer = byte_level_tokenizer();
        // First byte of "é" (0xc3 0xa9) on its own
        assert_eq!(tokenizer.decode(&[0xc3]), "\u{fffd}");
        assert_eq!(tokenizer.decode(&[0xc3, 0xa9]), "é");
    }

    #[test]
    fn test_decode_unknown_id_is_empty() {
        let tokenizer = byte_level_tokenizer();
        assert_eq!(tokenizer.decode(&[999_999]), "");
        assert_eq!(tokenizer.decode(&[b'h' as usize, 999_999, b'i' as usize]), "hi");
    }

    #[test]
    fn test_parallel_path_matches_sequential() {
        let vocab = byte_level_vocab(&["Ġt", "he", "Ġthe"]);
        let merges = MergeRanks::from_pairs([("Ġ", "t"), ("h", "e"), ("Ġt", "he")]);
        let tokenizer = BPETokenizer::new(vocab, merges).unwrap();

        let text = "the cat sat on the mat. ".repeat(10_000);
        assert!(text.len() > PARALLEL_THRESHOLD);

        let parallel = tokenizer.encode(&text).unwrap();
        let mut sequential = Vec::new();
        for segment in tokenizer.segment(&text).unwrap() {
            sequential.extend(tokenizer.encode_segment(segment).unwrap());
        }
        assert_eq!(parallel, sequential);
        assert_eq!(tokenizer.decode(&parallel), text);
    }

    #[test]
    fn test_stats() {
        let tokenizer = BPETokenizer::new(
            byte_level_vocab(&["ab"]),
            MergeRanks::from_pairs([("a", "b")]),
        )
        .unwrap();
        let stats = tokenizer.stats();
        assert_eq!(stats.vocab_size, 257);
        assert_eq!(stats.num_merges, 1);
        assert_eq!(stats.base_tokens, 256);
        assert_eq!(tokenizer.token_to_id("ab"), Some(256));
        assert_eq!(tokenizer.id_to_token(256), Some("ab"));
    }

    proptest! {
        #[test]
        fn prop_byte_level_roundtrip(text in "\\PC*") {
            let tokenizer = byte_level_tokenizer();
            let ids = tokenizer.encode(&text).unwrap();
            prop_assert_eq!(tokenizer.decode(&ids), text);
        }
    }
}
