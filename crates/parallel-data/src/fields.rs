use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::DataError;
use crate::shard::DataType;

pub const UNK_TOKEN: &str = "<unk>";
pub const PAD_TOKEN: &str = "<blank>";
pub const BOS_TOKEN: &str = "<s>";
pub const EOS_TOKEN: &str = "</s>";

const SPECIALS: [&str; 4] = [UNK_TOKEN, PAD_TOKEN, BOS_TOKEN, EOS_TOKEN];

/// Token/index mapping shared read-only by every shard of a run.
///
/// The reverse index is rebuilt on deserialization so serialized vocabularies
/// only carry the token list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "VocabData", into = "VocabData")]
pub struct Vocab {
    itos: Vec<String>,
    stoi: HashMap<String, u32>,
}

#[derive(Serialize, Deserialize)]
struct VocabData {
    itos: Vec<String>,
}

impl From<VocabData> for Vocab {
    fn from(value: VocabData) -> Self {
        Vocab::from_tokens(value.itos)
    }
}

impl From<Vocab> for VocabData {
    fn from(value: Vocab) -> Self {
        VocabData { itos: value.itos }
    }
}

impl Vocab {
    /// Builds a vocabulary with the special tokens first, then every
    /// remaining token in first-seen order.
    pub fn from_tokens(tokens: Vec<String>) -> Self {
        let mut itos: Vec<String> = SPECIALS.iter().map(|s| s.to_string()).collect();
        let mut stoi: HashMap<String, u32> = itos
            .iter()
            .enumerate()
            .map(|(idx, tok)| (tok.clone(), idx as u32))
            .collect();
        for token in tokens {
            if !stoi.contains_key(&token) {
                stoi.insert(token.clone(), itos.len() as u32);
                itos.push(token);
            }
        }
        Self { itos, stoi }
    }

    pub fn empty() -> Self {
        Self::from_tokens(Vec::new())
    }

    pub fn len(&self) -> usize {
        self.itos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.itos.is_empty()
    }

    /// Maps a token to its id, falling back to the unknown id.
    pub fn lookup(&self, token: &str) -> u32 {
        self.stoi.get(token).copied().unwrap_or(self.unk_id())
    }

    pub fn token(&self, id: u32) -> Option<&str> {
        self.itos.get(id as usize).map(|s| s.as_str())
    }

    pub fn unk_id(&self) -> u32 {
        0
    }

    pub fn pad_id(&self) -> u32 {
        1
    }

    pub fn tokens(&self) -> &[String] {
        &self.itos
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field {
    pub vocab: Vocab,
}

/// The field map for a run: `src`, `tgt`, the NLI label field `per`, plus any
/// feature fields the vocabulary file declares.
///
/// `per` always shares the target vocabulary; the binding is applied at
/// construction and must be re-applied after deserialization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldSet {
    fields: BTreeMap<String, Field>,
}

pub const SRC_FIELD: &str = "src";
pub const TGT_FIELD: &str = "tgt";
pub const NLI_FIELD: &str = "per";

impl FieldSet {
    pub fn new(mut fields: BTreeMap<String, Field>) -> Result<Self, DataError> {
        if !fields.contains_key(TGT_FIELD) {
            return Err(DataError::Format(format!(
                "field set is missing the '{}' field",
                TGT_FIELD
            )));
        }
        if !fields.contains_key(SRC_FIELD) {
            fields.insert(
                SRC_FIELD.to_string(),
                Field {
                    vocab: Vocab::empty(),
                },
            );
        }
        let mut set = Self { fields };
        set.bind_nli_vocab();
        Ok(set)
    }

    /// Loads `<prefix>.vocab.pt`: a JSON object mapping field names to token
    /// lists. Text runs require a source vocabulary; image and audio runs get
    /// a specials-only placeholder when none is declared.
    pub fn from_vocab_file(path: &Path, data_type: DataType) -> Result<Self, DataError> {
        let contents = fs::read_to_string(path).map_err(|err| {
            DataError::Io(std::io::Error::new(
                err.kind(),
                format!("failed to read vocab file {}: {}", path.display(), err),
            ))
        })?;
        let raw: BTreeMap<String, Vec<String>> = serde_json::from_str(&contents)?;

        if data_type == DataType::Text && !raw.contains_key(SRC_FIELD) {
            return Err(DataError::Format(format!(
                "vocab file {} declares no '{}' field for a text dataset",
                path.display(),
                SRC_FIELD
            )));
        }

        let fields = raw
            .into_iter()
            .map(|(name, tokens)| {
                (
                    name,
                    Field {
                        vocab: Vocab::from_tokens(tokens),
                    },
                )
            })
            .collect();
        Self::new(fields)
    }

    /// Points the NLI label field at the target vocabulary. Any vocabulary
    /// the file declared for it is discarded.
    pub fn bind_nli_vocab(&mut self) {
        let tgt_vocab = self.fields[TGT_FIELD].vocab.clone();
        self.fields
            .insert(NLI_FIELD.to_string(), Field { vocab: tgt_vocab });
    }

    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.get(name)
    }

    pub fn src(&self) -> &Field {
        &self.fields[SRC_FIELD]
    }

    pub fn tgt(&self) -> &Field {
        &self.fields[TGT_FIELD]
    }

    pub fn nli(&self) -> &Field {
        &self.fields[NLI_FIELD]
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(|name| name.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens(words: &[&str]) -> Vec<String> {
        words.iter().map(|w| w.to_string()).collect()
    }

    #[test]
    fn specials_come_first() {
        let vocab = Vocab::from_tokens(tokens(&["hello", "world"]));
        assert_eq!(vocab.token(0), Some(UNK_TOKEN));
        assert_eq!(vocab.token(1), Some(PAD_TOKEN));
        assert_eq!(vocab.lookup("hello"), 4);
        assert_eq!(vocab.lookup("nope"), vocab.unk_id());
    }

    #[test]
    fn nli_field_shares_target_vocab() {
        let mut fields = BTreeMap::new();
        fields.insert(
            SRC_FIELD.to_string(),
            Field {
                vocab: Vocab::from_tokens(tokens(&["a"])),
            },
        );
        fields.insert(
            TGT_FIELD.to_string(),
            Field {
                vocab: Vocab::from_tokens(tokens(&["entail", "contra"])),
            },
        );
        fields.insert(
            NLI_FIELD.to_string(),
            Field {
                vocab: Vocab::from_tokens(tokens(&["stale"])),
            },
        );

        let set = FieldSet::new(fields).unwrap();
        assert_eq!(set.nli().vocab, set.tgt().vocab);
        assert_eq!(set.nli().vocab.lookup("entail"), set.tgt().vocab.lookup("entail"));
    }

    #[test]
    fn reverse_index_survives_serde() {
        let vocab = Vocab::from_tokens(tokens(&["x", "y", "z"]));
        let json = serde_json::to_string(&vocab).unwrap();
        let restored: Vocab = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, vocab);
        assert_eq!(restored.lookup("z"), vocab.lookup("z"));
    }

    #[test]
    fn missing_target_field_rejected() {
        let mut fields = BTreeMap::new();
        fields.insert(
            SRC_FIELD.to_string(),
            Field {
                vocab: Vocab::empty(),
            },
        );
        assert!(FieldSet::new(fields).is_err());
    }
}
