use std::{
    fs::{self, File},
    io::{BufReader, BufWriter, Write},
    path::{Path, PathBuf},
};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::storage::{
    BlockMeta, BlockStore, ExecutionRef, StorageError, StorageResult, TaskExecution,
    select_block_at,
};

const MANIFEST_FILE: &str = "execution.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExecutionManifest {
    #[serde(flatten)]
    execution: ExecutionRef,
    sdp_raw: String,
    blocks: Vec<BlockEntry>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BlockEntry {
    id: u64,
    start_time: i64,
    length: u64,
}

/// Block store laid out on disk as `<root>/<task>/<execution>/`, holding an
/// `execution.json` manifest and one `block-<id>.bin` file per block.
#[derive(Debug, Clone)]
pub struct FileBlockStore {
    root: PathBuf,
}

impl FileBlockStore {
    pub fn open(root: impl Into<PathBuf>) -> StorageResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn execution_dir(&self, execution: &ExecutionRef) -> PathBuf {
        self.root
            .join(&execution.task_id)
            .join(execution.execute_id.to_string())
    }

    fn block_path(&self, execution: &ExecutionRef, block_id: u64) -> PathBuf {
        self.execution_dir(execution)
            .join(format!("block-{block_id}.bin"))
    }

    fn manifest(&self, execution: &ExecutionRef) -> StorageResult<ExecutionManifest> {
        let path = self.execution_dir(execution).join(MANIFEST_FILE);
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StorageError::ExecutionNotFound(execution.clone()));
            }
            Err(e) => return Err(e.into()),
        };

        Ok(serde_json::from_reader(BufReader::new(file))?)
    }

    /// Starts a new execution, replacing any blocks previously written for it.
    pub fn create_execution(
        &self,
        execution: ExecutionRef,
        sdp_raw: impl Into<String>,
    ) -> StorageResult<ExecutionWriter> {
        let dir = self.execution_dir(&execution);
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
        }
        fs::create_dir_all(&dir)?;

        info!(%execution, dir = %dir.display(), "Creating recorded execution");

        Ok(ExecutionWriter {
            dir,
            manifest: ExecutionManifest {
                execution,
                sdp_raw: sdp_raw.into(),
                blocks: vec![],
            },
        })
    }
}

impl BlockStore for FileBlockStore {
    fn fetch_block_meta(&self, execution: &ExecutionRef, block_id: u64) -> StorageResult<BlockMeta> {
        let manifest = self.manifest(execution)?;
        let entry = manifest
            .blocks
            .iter()
            .find(|b| b.id == block_id)
            .ok_or_else(|| StorageError::BlockNotFound {
                execution: execution.clone(),
                block_id,
            })?;

        Ok(BlockMeta {
            id: entry.id,
            execution: execution.clone(),
            start_time: entry.start_time,
            length: entry.length,
        })
    }

    fn read_block_payload(&self, meta: &BlockMeta) -> StorageResult<Bytes> {
        let path = self.block_path(&meta.execution, meta.id);
        let data = fs::read(&path)?;

        if data.len() as u64 != meta.length {
            return Err(StorageError::Failed(format!(
                "{} holds {} bytes, expected {}",
                path.display(),
                data.len(),
                meta.length
            )));
        }

        debug!(block_id = meta.id, len = data.len(), "Read block file");
        Ok(Bytes::from(data))
    }

    fn block_at(&self, execution: &ExecutionRef, start_time: i64) -> StorageResult<BlockMeta> {
        let manifest = self.manifest(execution)?;
        let mut blocks = manifest.blocks;
        blocks.sort_by_key(|b| b.id);

        let id = select_block_at(blocks.iter().map(|b| (b.id, b.start_time)), start_time)
            .ok_or_else(|| StorageError::Empty(execution.clone()))?;

        self.fetch_block_meta(execution, id)
    }

    fn execution(&self, execution: &ExecutionRef) -> StorageResult<TaskExecution> {
        let manifest = self.manifest(execution)?;
        Ok(TaskExecution {
            execution: manifest.execution,
            sdp_raw: manifest.sdp_raw,
        })
    }
}

/// Appends blocks to one execution of a [`FileBlockStore`].
///
/// Blocks become visible to readers once [`ExecutionWriter::finish`] writes the manifest.
#[derive(Debug)]
pub struct ExecutionWriter {
    dir: PathBuf,
    manifest: ExecutionManifest,
}

impl ExecutionWriter {
    pub fn execution(&self) -> &ExecutionRef {
        &self.manifest.execution
    }

    pub fn block_count(&self) -> usize {
        self.manifest.blocks.len()
    }

    pub fn append_block(&mut self, start_time: i64, data: &[u8]) -> StorageResult<u64> {
        let id = self
            .manifest
            .blocks
            .last()
            .map(|b| b.id + 1)
            .unwrap_or_default();

        let mut file = BufWriter::new(File::create(self.dir.join(format!("block-{id}.bin")))?);
        file.write_all(data)?;
        file.flush()?;

        self.manifest.blocks.push(BlockEntry {
            id,
            start_time,
            length: data.len() as u64,
        });

        Ok(id)
    }

    pub fn finish(self) -> StorageResult<ExecutionRef> {
        let file = File::create(self.dir.join(MANIFEST_FILE))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, &self.manifest)?;
        writer.flush()?;

        info!(
            execution = %self.manifest.execution,
            blocks = self.manifest.blocks.len(),
            "Finished recorded execution"
        );

        Ok(self.manifest.execution)
    }
}
