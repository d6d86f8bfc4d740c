use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::DataError;
use crate::fields::FieldSet;

/// Modality tag fixed at preprocessing time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Text,
    Img,
    Audio,
}

/// One aligned record: source tokens, target tokens, the NLI label, and any
/// per-token feature streams the preprocessor emitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Example {
    pub src: Vec<String>,
    pub tgt: Vec<String>,
    pub label: String,
    #[serde(default)]
    pub feats: BTreeMap<String, Vec<String>>,
}

/// An immutable, file-backed partition of a corpus role. Loaded only when
/// iteration reaches it; the field set is bound after loading and never
/// serialized with the shard.
#[derive(Debug, Serialize, Deserialize)]
pub struct ShardDataset {
    pub data_type: DataType,
    pub examples: Vec<Example>,
    #[serde(skip)]
    fields: Option<Arc<FieldSet>>,
}

impl ShardDataset {
    pub fn new(data_type: DataType, examples: Vec<Example>) -> Self {
        Self {
            data_type,
            examples,
            fields: None,
        }
    }

    pub fn load(path: &Path) -> Result<Self, DataError> {
        let contents = fs::read_to_string(path).map_err(|err| {
            DataError::Io(std::io::Error::new(
                err.kind(),
                format!("failed to read shard {}: {}", path.display(), err),
            ))
        })?;
        let dataset = serde_json::from_str(&contents)
            .map_err(|err| DataError::Format(format!("shard {}: {}", path.display(), err)))?;
        Ok(dataset)
    }

    pub fn save(&self, path: &Path) -> Result<(), DataError> {
        let contents = serde_json::to_string(self)?;
        fs::write(path, contents)?;
        Ok(())
    }

    pub fn bind_fields(&mut self, fields: Arc<FieldSet>) {
        self.fields = Some(fields);
    }

    pub fn fields(&self) -> Option<&Arc<FieldSet>> {
        self.fields.as_ref()
    }

    pub fn len(&self) -> usize {
        self.examples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.examples.is_empty()
    }
}

/// Ordered listing of a corpus role's shard files.
///
/// Discovery only enumerates paths: numbered shards
/// `<prefix>.<role>.<index>.pt` sorted by ascending index, else the singleton
/// `<prefix>.<role>.pt`. An empty catalog is not an error until something
/// iterates it.
#[derive(Debug, Clone)]
pub struct ShardCatalog {
    role: String,
    paths: Vec<PathBuf>,
}

impl ShardCatalog {
    pub fn discover(prefix: &Path, role: &str) -> Result<Self, DataError> {
        let stem = prefix
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| {
                DataError::Format(format!(
                    "corpus prefix {} has no usable file name",
                    prefix.display()
                ))
            })?;
        let dir = match prefix.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };

        let mut numbered: Vec<(usize, PathBuf)> = Vec::new();
        let wanted_prefix = format!("{}.{}.", stem, role);
        match fs::read_dir(&dir) {
            Ok(entries) => {
                for entry in entries {
                    let entry = entry?;
                    let name = entry.file_name();
                    let Some(name) = name.to_str() else {
                        continue;
                    };
                    let Some(rest) = name.strip_prefix(&wanted_prefix) else {
                        continue;
                    };
                    let Some(index_str) = rest.strip_suffix(".pt") else {
                        continue;
                    };
                    if let Ok(index) = index_str.parse::<usize>() {
                        numbered.push((index, entry.path()));
                    }
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(DataError::Io(err)),
        }

        numbered.sort_by_key(|(index, _)| *index);
        let paths = if numbered.is_empty() {
            let singleton = dir.join(format!("{}.{}.pt", stem, role));
            if singleton.is_file() {
                vec![singleton]
            } else {
                Vec::new()
            }
        } else {
            numbered.into_iter().map(|(_, path)| path).collect()
        };

        Ok(Self {
            role: role.to_string(),
            paths,
        })
    }

    pub fn role(&self) -> &str {
        &self.role
    }

    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    /// Loads the first shard just far enough to read its modality tag.
    pub fn peek_data_type(&self) -> Result<DataType, DataError> {
        let first = self.paths.first().ok_or_else(|| {
            DataError::missing(format!("no shard files found for role '{}'", self.role))
        })?;
        let shard = ShardDataset::load(first)?;
        Ok(shard.data_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn example(src: &[&str], tgt: &[&str], label: &str) -> Example {
        Example {
            src: src.iter().map(|s| s.to_string()).collect(),
            tgt: tgt.iter().map(|s| s.to_string()).collect(),
            label: label.to_string(),
            feats: BTreeMap::new(),
        }
    }

    fn write_shard(path: &Path, count: usize) {
        let examples = (0..count)
            .map(|i| example(&["a", "b"], &["c"], if i % 2 == 0 { "yes" } else { "no" }))
            .collect();
        ShardDataset::new(DataType::Text, examples).save(path).unwrap();
    }

    #[test]
    fn numbered_shards_sort_numerically() {
        let dir = tempfile::tempdir().unwrap();
        for index in [10usize, 2, 0, 1] {
            write_shard(&dir.path().join(format!("demo.train.{}.pt", index)), 1);
        }

        let catalog = ShardCatalog::discover(&dir.path().join("demo"), "train").unwrap();
        let names: Vec<_> = catalog
            .paths()
            .iter()
            .map(|p| p.file_name().unwrap().to_str().unwrap().to_string())
            .collect();
        assert_eq!(
            names,
            vec![
                "demo.train.0.pt",
                "demo.train.1.pt",
                "demo.train.2.pt",
                "demo.train.10.pt"
            ]
        );
    }

    #[test]
    fn singleton_used_when_no_numbered_shards() {
        let dir = tempfile::tempdir().unwrap();
        write_shard(&dir.path().join("demo.valid.pt"), 3);

        let catalog = ShardCatalog::discover(&dir.path().join("demo"), "valid").unwrap();
        assert_eq!(catalog.paths().len(), 1);
    }

    #[test]
    fn discovery_of_absent_role_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = ShardCatalog::discover(&dir.path().join("demo"), "train").unwrap();
        assert!(catalog.is_empty());
    }

    #[test]
    fn peek_reads_modality_from_first_shard() {
        let dir = tempfile::tempdir().unwrap();
        write_shard(&dir.path().join("demo.train.0.pt"), 2);

        let catalog = ShardCatalog::discover(&dir.path().join("demo"), "train").unwrap();
        assert_eq!(catalog.peek_data_type().unwrap(), DataType::Text);
    }

    #[test]
    fn shard_round_trip_drops_bound_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("demo.train.pt");
        write_shard(&path, 4);

        let loaded = ShardDataset::load(&path).unwrap();
        assert_eq!(loaded.len(), 4);
        assert!(loaded.fields().is_none());
    }
}
