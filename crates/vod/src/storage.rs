use std::{
    collections::{BTreeMap, HashMap, HashSet},
    fmt,
    sync::Arc,
};

use bytes::Bytes;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type StorageResult<T> = Result<T, StorageError>;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Execution {0} not found")]
    ExecutionNotFound(ExecutionRef),

    #[error("Block {block_id} of execution {execution} not found")]
    BlockNotFound {
        execution: ExecutionRef,
        block_id: u64,
    },

    #[error("Execution {0} has no blocks")]
    Empty(ExecutionRef),

    #[error("IO/{0}")]
    Io(#[from] std::io::Error),

    #[error("Manifest/{0}")]
    Manifest(#[from] serde_json::Error),

    #[error("{0}")]
    Failed(String),
}

/// Identifies one execution of a recording task.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRef {
    pub task_id: String,
    pub execute_id: i64,
}

impl ExecutionRef {
    pub fn new(task_id: impl Into<String>, execute_id: i64) -> Self {
        Self {
            task_id: task_id.into(),
            execute_id,
        }
    }
}

impl fmt::Display for ExecutionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.task_id, self.execute_id)
    }
}

/// Everything known about a block except its bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockMeta {
    pub id: u64,
    pub execution: ExecutionRef,
    /// Start of the block, in seconds on the recording's time axis.
    pub start_time: i64,
    pub length: u64,
}

#[derive(Debug, Clone)]
pub struct TaskExecution {
    pub execution: ExecutionRef,
    pub sdp_raw: String,
}

/// A block together with its payload, as handed from the block reader to the pacer.
#[derive(Debug, Clone)]
pub struct Block {
    pub meta: BlockMeta,
    pub data: Bytes,
}

/// Recorded block storage.
///
/// Calls may block on I/O; callers never retry them.
pub trait BlockStore: Send + Sync {
    fn fetch_block_meta(&self, execution: &ExecutionRef, block_id: u64) -> StorageResult<BlockMeta>;

    fn read_block_payload(&self, meta: &BlockMeta) -> StorageResult<Bytes>;

    /// The last block starting at or before `start_time`, or the first block if the
    /// recording starts later.
    fn block_at(&self, execution: &ExecutionRef, start_time: i64) -> StorageResult<BlockMeta>;

    fn execution(&self, execution: &ExecutionRef) -> StorageResult<TaskExecution>;
}

impl<T: BlockStore + ?Sized> BlockStore for Arc<T> {
    fn fetch_block_meta(&self, execution: &ExecutionRef, block_id: u64) -> StorageResult<BlockMeta> {
        (**self).fetch_block_meta(execution, block_id)
    }

    fn read_block_payload(&self, meta: &BlockMeta) -> StorageResult<Bytes> {
        (**self).read_block_payload(meta)
    }

    fn block_at(&self, execution: &ExecutionRef, start_time: i64) -> StorageResult<BlockMeta> {
        (**self).block_at(execution, start_time)
    }

    fn execution(&self, execution: &ExecutionRef) -> StorageResult<TaskExecution> {
        (**self).execution(execution)
    }
}

/// Picks the block covering `start_time` from `(id, start_time)` pairs sorted by id.
pub(crate) fn select_block_at(
    blocks: impl IntoIterator<Item = (u64, i64)>,
    start_time: i64,
) -> Option<u64> {
    let mut first = None;
    let mut covering = None;

    for (id, block_start) in blocks {
        first.get_or_insert(id);
        if block_start <= start_time {
            covering = Some(id);
        } else {
            break;
        }
    }

    covering.or(first)
}

#[derive(Default)]
struct MemExecution {
    sdp_raw: String,
    blocks: BTreeMap<u64, MemBlock>,
    failing_reads: HashSet<u64>,
}

struct MemBlock {
    start_time: i64,
    data: Bytes,
}

/// Block store kept entirely in memory.
#[derive(Clone, Default)]
pub struct MemoryBlockStore {
    executions: Arc<RwLock<HashMap<ExecutionRef, MemExecution>>>,
}

impl fmt::Debug for MemoryBlockStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let executions = self.executions.read();
        f.debug_struct("MemoryBlockStore")
            .field("executions", &executions.len())
            .finish()
    }
}

impl MemoryBlockStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates (or replaces the description of) an execution.
    pub fn insert_execution(&self, execution: ExecutionRef, sdp_raw: impl Into<String>) {
        let mut executions = self.executions.write();
        executions.entry(execution).or_default().sdp_raw = sdp_raw.into();
    }

    /// Appends a block after the highest existing id and returns its id.
    pub fn push_block(&self, execution: &ExecutionRef, start_time: i64, data: impl Into<Bytes>) -> u64 {
        let mut executions = self.executions.write();
        let entry = executions.entry(execution.clone()).or_default();
        let id = entry
            .blocks
            .last_key_value()
            .map(|(id, _)| id + 1)
            .unwrap_or_default();
        entry.blocks.insert(
            id,
            MemBlock {
                start_time,
                data: data.into(),
            },
        );
        id
    }

    /// Makes payload reads of a block fail, as a damaged file would.
    pub fn fail_reads(&self, execution: &ExecutionRef, block_id: u64) {
        let mut executions = self.executions.write();
        executions
            .entry(execution.clone())
            .or_default()
            .failing_reads
            .insert(block_id);
    }

    pub fn block_count(&self, execution: &ExecutionRef) -> usize {
        self.executions
            .read()
            .get(execution)
            .map(|e| e.blocks.len())
            .unwrap_or_default()
    }
}

impl BlockStore for MemoryBlockStore {
    fn fetch_block_meta(&self, execution: &ExecutionRef, block_id: u64) -> StorageResult<BlockMeta> {
        let executions = self.executions.read();
        let entry = executions
            .get(execution)
            .ok_or_else(|| StorageError::ExecutionNotFound(execution.clone()))?;
        let block = entry
            .blocks
            .get(&block_id)
            .ok_or_else(|| StorageError::BlockNotFound {
                execution: execution.clone(),
                block_id,
            })?;

        Ok(BlockMeta {
            id: block_id,
            execution: execution.clone(),
            start_time: block.start_time,
            length: block.data.len() as u64,
        })
    }

    fn read_block_payload(&self, meta: &BlockMeta) -> StorageResult<Bytes> {
        let executions = self.executions.read();
        let entry = executions
            .get(&meta.execution)
            .ok_or_else(|| StorageError::ExecutionNotFound(meta.execution.clone()))?;

        if entry.failing_reads.contains(&meta.id) {
            return Err(StorageError::Failed(format!(
                "block {} of execution {} is unreadable",
                meta.id, meta.execution
            )));
        }

        entry
            .blocks
            .get(&meta.id)
            .map(|block| block.data.clone())
            .ok_or_else(|| StorageError::BlockNotFound {
                execution: meta.execution.clone(),
                block_id: meta.id,
            })
    }

    fn block_at(&self, execution: &ExecutionRef, start_time: i64) -> StorageResult<BlockMeta> {
        let id = {
            let executions = self.executions.read();
            let entry = executions
                .get(execution)
                .ok_or_else(|| StorageError::ExecutionNotFound(execution.clone()))?;
            select_block_at(
                entry.blocks.iter().map(|(id, block)| (*id, block.start_time)),
                start_time,
            )
            .ok_or_else(|| StorageError::Empty(execution.clone()))?
        };

        self.fetch_block_meta(execution, id)
    }

    fn execution(&self, execution: &ExecutionRef) -> StorageResult<TaskExecution> {
        let executions = self.executions.read();
        let entry = executions
            .get(execution)
            .ok_or_else(|| StorageError::ExecutionNotFound(execution.clone()))?;

        Ok(TaskExecution {
            execution: execution.clone(),
            sdp_raw: entry.sdp_raw.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn execution() -> ExecutionRef {
        ExecutionRef::new("task", 7)
    }

    #[test]
    fn block_at_picks_covering_block() {
        let store = MemoryBlockStore::new();
        store.insert_execution(execution(), "v=0");
        for start in [100, 110, 120] {
            store.push_block(&execution(), start, vec![0u8; 4]);
        }

        assert_eq!(store.block_at(&execution(), 115).unwrap().id, 1);
        assert_eq!(store.block_at(&execution(), 120).unwrap().id, 2);
        assert_eq!(store.block_at(&execution(), 5000).unwrap().id, 2);
        // before the recording started
        assert_eq!(store.block_at(&execution(), 0).unwrap().id, 0);
    }

    #[test]
    fn missing_blocks_and_executions_are_reported() {
        let store = MemoryBlockStore::new();
        assert!(matches!(
            store.execution(&execution()),
            Err(StorageError::ExecutionNotFound(_))
        ));

        store.insert_execution(execution(), "v=0");
        assert!(matches!(
            store.block_at(&execution(), 0),
            Err(StorageError::Empty(_))
        ));
        assert!(matches!(
            store.fetch_block_meta(&execution(), 3),
            Err(StorageError::BlockNotFound { block_id: 3, .. })
        ));
    }

    #[test]
    fn failing_reads_keep_metadata_available() {
        let store = MemoryBlockStore::new();
        store.insert_execution(execution(), "v=0");
        let id = store.push_block(&execution(), 0, vec![1u8, 2, 3]);
        store.fail_reads(&execution(), id);

        let meta = store.fetch_block_meta(&execution(), id).unwrap();
        assert_eq!(meta.length, 3);
        assert!(matches!(
            store.read_block_payload(&meta),
            Err(StorageError::Failed(_))
        ));
    }
}
