use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;
use tempfile::NamedTempFile;
use tracing::{debug, info};

use super::RemoteGateway;
use crate::entity::{Entity, EntityId, EntityKind, Fields};

#[derive(Debug)]
pub struct FileGateway {
    pub data_dir: PathBuf,
    tags_path: PathBuf,
    write_lock: Mutex<()>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredRecord {
    id: String,
    #[serde(flatten)]
    fields: Fields,
}

impl FileGateway {
    #[tracing::instrument(skip(data_dir))]
    pub fn open(data_dir: &Path) -> anyhow::Result<Self> {
        let data_dir = data_dir.to_path_buf();
        fs::create_dir_all(&data_dir)
            .with_context(|| format!("failed to create {}", data_dir.display()))?;

        let tags_path = data_dir.join("tags.data");
        let mut paths: Vec<PathBuf> = EntityKind::ALL
            .iter()
            .map(|kind| collection_path(&data_dir, *kind))
            .collect();
        paths.push(tags_path.clone());

        for path in &paths {
            if !path.exists() {
                fs::write(path, "")
                    .with_context(|| format!("failed to create {}", path.display()))?;
            }
        }

        info!(data_dir = %data_dir.display(), "opened file gateway");

        Ok(Self {
            data_dir,
            tags_path,
            write_lock: Mutex::new(()),
        })
    }

    pub fn path_for(&self, kind: EntityKind) -> PathBuf {
        collection_path(&self.data_dir, kind)
    }

    fn load(&self, kind: EntityKind) -> anyhow::Result<Vec<StoredRecord>> {
        let path = self.path_for(kind);
        load_jsonl(&path).with_context(|| format!("failed to load {}", path.display()))
    }

    fn save(&self, kind: EntityKind, records: &[StoredRecord]) -> anyhow::Result<()> {
        let path = self.path_for(kind);
        save_jsonl_atomic(&path, records)
            .with_context(|| format!("failed to save {}", path.display()))
    }

    fn next_id(records: &[StoredRecord]) -> u64 {
        records
            .iter()
            .filter_map(|r| r.id.parse::<u64>().ok())
            .max()
            .unwrap_or(0)
            + 1
    }
}

fn collection_path(data_dir: &Path, kind: EntityKind) -> PathBuf {
    data_dir.join(format!("{}.data", kind.collection()))
}

#[async_trait]
impl RemoteGateway for FileGateway {
    #[tracing::instrument(skip(self, entity), fields(kind = %entity.kind, temp = %entity.id))]
    async fn create(&self, entity: &Entity) -> anyhow::Result<Option<String>> {
        let _guard = self.write_lock.lock();
        let mut records = self.load(entity.kind)?;
        let id = Self::next_id(&records).to_string();
        records.push(StoredRecord {
            id: id.clone(),
            fields: entity.fields.clone(),
        });
        self.save(entity.kind, &records)?;
        debug!(id = %id, "stored new record");
        Ok(Some(id))
    }

    #[tracing::instrument(skip(self, value))]
    async fn update(
        &self,
        kind: EntityKind,
        id: &str,
        field: &str,
        value: &Value,
    ) -> anyhow::Result<()> {
        let _guard = self.write_lock.lock();
        let mut records = self.load(kind)?;
        let record = records
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| anyhow!("{kind} {id} not found"))?;
        record.fields.insert(field.to_string(), value.clone());
        self.save(kind, &records)
    }

    #[tracing::instrument(skip(self))]
    async fn delete(&self, kind: EntityKind, id: &str) -> anyhow::Result<()> {
        let _guard = self.write_lock.lock();
        let mut records = self.load(kind)?;
        let before = records.len();
        records.retain(|r| r.id != id);
        if records.len() == before {
            return Err(anyhow!("{kind} {id} not found"));
        }
        self.save(kind, &records)
    }

    #[tracing::instrument(skip(self, tags), fields(count = tags.len()))]
    async fn persist_tag_set(&self, tags: &[String]) -> anyhow::Result<()> {
        let _guard = self.write_lock.lock();
        save_jsonl_atomic(&self.tags_path, tags).context("failed to save tags.data")
    }

    #[tracing::instrument(skip(self))]
    async fn fetch_all(&self, kind: EntityKind) -> anyhow::Result<Vec<Entity>> {
        let records = self.load(kind)?;
        Ok(records
            .into_iter()
            .map(|r| Entity::new(kind, EntityId::Confirmed(r.id), r.fields))
            .collect())
    }

    #[tracing::instrument(skip(self))]
    async fn fetch_tags(&self) -> anyhow::Result<Vec<String>> {
        load_jsonl(&self.tags_path).context("failed to load tags.data")
    }
}

fn load_jsonl<T: DeserializeOwned>(path: &Path) -> anyhow::Result<Vec<T>> {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
        Err(err) => return Err(err.into()),
    };

    let records = text
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(idx, line)| {
            serde_json::from_str(line)
                .with_context(|| format!("{} line {} is not valid JSON", path.display(), idx + 1))
        })
        .collect::<anyhow::Result<Vec<T>>>()?;
    debug!(file = %path.display(), count = records.len(), "read records");
    Ok(records)
}

fn save_jsonl_atomic<T: Serialize>(path: &Path, items: &[T]) -> anyhow::Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut staged = NamedTempFile::new_in(dir)?;
    {
        let mut out = BufWriter::new(staged.as_file_mut());
        for item in items {
            serde_json::to_writer(&mut out, item)?;
            out.write_all(b"\n")?;
        }
        out.flush()?;
    }
    staged.as_file().sync_all()?;
    staged
        .persist(path)
        .map_err(|err| anyhow!("failed to replace {}: {}", path.display(), err.error))?;
    debug!(file = %path.display(), count = items.len(), "wrote records");
    Ok(())
}
