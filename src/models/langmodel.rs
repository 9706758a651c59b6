//! The on-disk language-model container and its in-memory form.
//!
//! A model file holds a fixed header, then eight section offsets: the
//! forward and reverse n-gram tries, the counts-by-length vector, the word
//! unigram list, and four reserved slots. All integers are little-endian.

use std::io::{self, Write};
use std::path::Path;

use crate::models::builder::TrieBuilder;
use crate::models::pstrie::{PackedTrie, TrieError};
use crate::models::words::for_each_word;

pub const MODEL_SIGNATURE: &[u8; 10] = b"LangModel\0";
pub const MODEL_FORMAT_VERSION: u8 = 1;

const HEADER_SIZE: usize = 14 + 8 * 8;
const NUM_SECTIONS: usize = 8;

#[derive(Debug)]
pub enum ModelError {
    BadSignature,
    UnsupportedVersion(u8),
    Truncated,
    BadSection(&'static str),
    Trie(TrieError),
}

impl core::fmt::Display for ModelError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            ModelError::BadSignature => write!(f, "missing LangModel signature"),
            ModelError::UnsupportedVersion(v) => {
                write!(f, "unsupported LangModel format version {}", v)
            }
            ModelError::Truncated => write!(f, "LangModel file is truncated"),
            ModelError::BadSection(name) => write!(f, "malformed {} section", name),
            ModelError::Trie(e) => write!(f, "bad trie section: {}", e),
        }
    }
}

impl std::error::Error for ModelError {}

impl From<TrieError> for ModelError {
    fn from(e: TrieError) -> Self {
        ModelError::Trie(e)
    }
}

/// Language models backing reconstruction: bidirectional n-gram tries plus
/// an optional word-unigram model.
#[derive(Debug)]
pub struct Models {
    forward: PackedTrie,
    reverse: PackedTrie,
    ngram_counts: Vec<u64>,
    ngram_avg_freq: Vec<f64>,
    word_model: Option<PackedTrie>,
}

fn read_u64_at(bytes: &[u8], offset: usize) -> Option<u64> {
    bytes.get(offset..offset + 8).map(|s| {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(s);
        u64::from_le_bytes(buf)
    })
}

fn read_u32_at(bytes: &[u8], offset: usize) -> Option<u32> {
    bytes.get(offset..offset + 4).map(|s| {
        let mut buf = [0u8; 4];
        buf.copy_from_slice(s);
        u32::from_le_bytes(buf)
    })
}

impl Models {
    pub fn load(path: &Path) -> io::Result<Models> {
        let bytes = std::fs::read(path)?;
        Models::from_bytes(&bytes)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Models, ModelError> {
        if bytes.len() < HEADER_SIZE {
            return Err(ModelError::Truncated);
        }
        if &bytes[..MODEL_SIGNATURE.len()] != MODEL_SIGNATURE {
            return Err(ModelError::BadSignature);
        }
        let version = bytes[10];
        if version != MODEL_FORMAT_VERSION {
            return Err(ModelError::UnsupportedVersion(version));
        }
        let mut offsets = [0u64; NUM_SECTIONS];
        for (i, slot) in offsets.iter_mut().enumerate() {
            *slot = read_u64_at(bytes, 14 + 8 * i).ok_or(ModelError::Truncated)?;
        }
        let section = |idx: usize| -> Result<&[u8], ModelError> {
            let start = offsets[idx] as usize;
            if start == 0 || start >= bytes.len() {
                return Err(ModelError::Truncated);
            }
            // sections are written in order; the next nonzero offset (or
            // the file end) bounds this one
            let end = offsets
                .iter()
                .map(|&o| o as usize)
                .filter(|&o| o > start && o <= bytes.len())
                .min()
                .unwrap_or(bytes.len());
            Ok(&bytes[start..end])
        };

        let forward = PackedTrie::from_bytes(section(0)?.to_vec())?;
        let reverse = PackedTrie::from_bytes(section(1)?.to_vec())?;

        let counts_bytes = section(2)?;
        let n = read_u32_at(counts_bytes, 0).ok_or(ModelError::BadSection("ngram counts"))?
            as usize;
        let mut ngram_counts = Vec::with_capacity(n);
        for i in 0..n {
            ngram_counts.push(
                read_u64_at(counts_bytes, 4 + 8 * i)
                    .ok_or(ModelError::BadSection("ngram counts"))?,
            );
        }

        let word_model = match offsets[3] {
            0 => None,
            _ => {
                let words_bytes = section(3)?;
                let count = read_u32_at(words_bytes, 0)
                    .ok_or(ModelError::BadSection("word unigrams"))?;
                let mut builder = TrieBuilder::new();
                let mut pos = 4usize;
                for _ in 0..count {
                    let freq = read_u64_at(words_bytes, pos)
                        .ok_or(ModelError::BadSection("word unigrams"))?;
                    let len = words_bytes
                        .get(pos + 8..pos + 10)
                        .map(|s| u16::from_le_bytes([s[0], s[1]]))
                        .ok_or(ModelError::BadSection("word unigrams"))?
                        as usize;
                    let key = words_bytes
                        .get(pos + 10..pos + 10 + len)
                        .ok_or(ModelError::BadSection("word unigrams"))?;
                    builder.insert(key, freq.min(u32::MAX as u64) as u32);
                    pos += 10 + len;
                }
                if builder.is_empty() {
                    None
                } else {
                    Some(builder.pack())
                }
            }
        };

        let ngram_avg_freq = average_frequencies(&forward);
        Ok(Models {
            forward,
            reverse,
            ngram_counts,
            ngram_avg_freq,
            word_model,
        })
    }

    /// Serialize a model file from its parts.
    pub fn write_file<W: Write>(
        forward: &PackedTrie,
        reverse: &PackedTrie,
        ngram_counts: &[u64],
        words: &[(Vec<u8>, u64)],
        out: &mut W,
    ) -> io::Result<()> {
        let mut fwd = Vec::new();
        forward.write_to(&mut fwd)?;
        let mut rev = Vec::new();
        reverse.write_to(&mut rev)?;

        let mut counts = Vec::new();
        counts.extend_from_slice(&(ngram_counts.len() as u32).to_le_bytes());
        for &c in ngram_counts {
            counts.extend_from_slice(&c.to_le_bytes());
        }

        let mut word_section = Vec::new();
        if !words.is_empty() {
            word_section.extend_from_slice(&(words.len() as u32).to_le_bytes());
            for (key, freq) in words {
                word_section.extend_from_slice(&freq.to_le_bytes());
                word_section.extend_from_slice(&(key.len() as u16).to_le_bytes());
                word_section.extend_from_slice(key);
            }
        }

        let mut offsets = [0u64; NUM_SECTIONS];
        let mut cursor = HEADER_SIZE as u64;
        offsets[0] = cursor;
        cursor += fwd.len() as u64;
        offsets[1] = cursor;
        cursor += rev.len() as u64;
        offsets[2] = cursor;
        cursor += counts.len() as u64;
        if !word_section.is_empty() {
            offsets[3] = cursor;
        }

        out.write_all(MODEL_SIGNATURE)?;
        out.write_all(&[MODEL_FORMAT_VERSION, 0, 0, 0])?;
        for &o in &offsets {
            out.write_all(&o.to_le_bytes())?;
        }
        out.write_all(&fwd)?;
        out.write_all(&rev)?;
        out.write_all(&counts)?;
        out.write_all(&word_section)?;
        Ok(())
    }

    /// Build a model directly from sample text. Model *training* proper is
    /// an offline concern; this helper packs just enough statistics for
    /// recovery runs and tests.
    pub fn from_text(text: &[u8], max_ngram: usize) -> Models {
        let mut fwd = TrieBuilder::new();
        fwd.add_ngrams(text, max_ngram);
        let reversed: Vec<u8> = text.iter().rev().copied().collect();
        let mut rev = TrieBuilder::new();
        rev.add_ngrams(&reversed, max_ngram);
        let mut words = TrieBuilder::new();
        for_each_word(text, |w| words.insert(w, 1));
        let forward = fwd.pack();
        let reverse = rev.pack();
        let mut ngram_counts = vec![0u64; max_ngram + 1];
        for (len, (count, _total)) in forward.level_statistics().iter().enumerate() {
            if len < ngram_counts.len() {
                ngram_counts[len] = *count;
            }
        }
        let ngram_avg_freq = average_frequencies(&forward);
        Models {
            forward,
            reverse,
            ngram_counts,
            ngram_avg_freq,
            word_model: if words.is_empty() {
                None
            } else {
                Some(words.pack())
            },
        }
    }

    pub fn forward(&self) -> &PackedTrie {
        &self.forward
    }

    pub fn reverse(&self) -> &PackedTrie {
        &self.reverse
    }

    pub fn word_model(&self) -> Option<&PackedTrie> {
        self.word_model.as_ref()
    }

    pub fn ngram_counts(&self) -> &[u64] {
        &self.ngram_counts
    }

    pub fn longest_ngram(&self) -> usize {
        self.forward.longest_key()
    }

    /// Mean frequency of n-grams of the given length.
    pub fn average_frequency(&self, len: usize) -> f64 {
        self.ngram_avg_freq.get(len).copied().unwrap_or(1.0).max(1.0)
    }
}

fn average_frequencies(trie: &PackedTrie) -> Vec<f64> {
    trie.level_statistics()
        .iter()
        .map(|&(count, total)| {
            if count == 0 {
                1.0
            } else {
                total as f64 / count as f64
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &[u8] =
        b"the quick brown fox jumps over the lazy dog while the cat naps in the warm sun";

    #[test]
    fn file_round_trip() {
        let models = Models::from_text(SAMPLE, 4);
        let words = vec![(b"the".to_vec(), 4u64), (b"fox".to_vec(), 1u64)];
        let mut file = Vec::new();
        Models::write_file(
            models.forward(),
            models.reverse(),
            models.ngram_counts(),
            &words,
            &mut file,
        )
        .unwrap();
        let loaded = Models::from_bytes(&file).unwrap();
        assert_eq!(loaded.longest_ngram(), 4);
        assert_eq!(
            loaded.forward().find(b"the "),
            models.forward().find(b"the ")
        );
        assert_eq!(loaded.word_model().unwrap().find(b"the"), Some(4));
        assert_eq!(loaded.word_model().unwrap().find(b"cat"), None);
    }

    #[test]
    fn reverse_model_mirrors_forward() {
        let models = Models::from_text(b"abcd abcd abcd", 3);
        assert_eq!(models.forward().find(b"ab"), models.reverse().find(b"ba"));
        assert_eq!(models.forward().find(b"bcd"), models.reverse().find(b"dcb"));
    }

    #[test]
    fn bad_signature_rejected() {
        let err = Models::from_bytes(b"NotAModel\0padpadpadpad").unwrap_err();
        assert!(matches!(
            err,
            ModelError::BadSignature | ModelError::Truncated
        ));
    }

    #[test]
    fn average_frequency_reflects_repetition() {
        let models = Models::from_text(b"aaaaaaaaaaaaaaaa", 3);
        // a single trigram repeated many times has a high mean frequency
        assert!(models.average_frequency(3) > 10.0);
    }
}
