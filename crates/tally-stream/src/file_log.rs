use std::{
    collections::HashMap,
    ffi::OsString,
    io::SeekFrom,
    path::{Path, PathBuf},
    time::Duration,
};

use async_trait::async_trait;
use tally_common::{
    error::{Result, TallyError},
    time::now,
};
use tokio::{
    fs::{File, OpenOptions},
    io::{AsyncBufReadExt, AsyncSeekExt, AsyncWriteExt, BufReader},
    sync::Mutex,
};
use tracing::{info, warn};

use crate::log::{EntryId, LogCursor, LogRecord, PartitionLease, StreamLog, check_partition};

const LEASE_LOCK_ATTEMPTS: u32 = 50;
const LEASE_LOCK_RETRY: Duration = Duration::from_millis(10);
/// A lease lock older than this was left behind by a process that died mid-claim.
const STALE_LEASE_LOCK: Duration = Duration::from_secs(10);

#[derive(Debug)]
struct PartitionWriter {
    path: PathBuf,
    file: File,
    /// Length covered by complete entries.
    len: u64,
    next_offset: u64,
    /// Set when a failed write could not be rolled back.
    poisoned: bool,
}

impl PartitionWriter {
    async fn append_line(&mut self, line: &[u8]) -> Result<u64> {
        if self.poisoned {
            return Err(TallyError::InternalError(format!(
                "{} holds a partial entry; reopen the log",
                self.path.display()
            )));
        }
        self.catch_up().await?;

        if let Err(err) = write_synced(&mut self.file, line).await {
            self.rollback().await;
            return Err(err.into());
        }
        self.len += line.len() as u64;
        let offset = self.next_offset;
        self.next_offset += 1;
        Ok(offset)
    }

    /// Re-derives the next offset when the file changed behind this writer.
    async fn catch_up(&mut self) -> Result<()> {
        let len = self.file.metadata().await?.len();
        if len == self.len {
            return Ok(());
        }
        let (complete, valid_len) = scan_complete_lines(&self.path).await?;
        if len > valid_len {
            warn!(path = %self.path.display(), "discarding incomplete trailing entry");
            self.file.set_len(valid_len).await?;
        }
        self.len = valid_len;
        self.next_offset = complete;
        Ok(())
    }

    /// Cuts the file back to the last complete entry.
    async fn rollback(&mut self) {
        if let Err(err) = self.file.set_len(self.len).await {
            warn!(
                path = %self.path.display(),
                error = %err,
                "failed to discard partial entry, refusing further appends"
            );
            self.poisoned = true;
        }
    }
}

async fn write_synced(file: &mut File, line: &[u8]) -> std::io::Result<()> {
    file.write_all(line).await?;
    file.flush().await?;
    file.sync_data().await
}

/// Log stored as one file per partition under a directory.
///
/// Each line of `partition-{n}.log` is one entry encoded as a JSON string;
/// the line number is the offset. Under `groups/{group}/` each partition
/// has a committed offset (`partition-{n}.offset`) and an ownership lease
/// (`partition-{n}.lease`), both replaced atomically.
///
/// One appending process per directory is supported; a writer picks up
/// entries appended by another handle before its next write, but two
/// processes appending at the same instant may interleave.
#[derive(Debug)]
pub struct FileLog {
    dir: PathBuf,
    writers: Vec<Mutex<PartitionWriter>>,
    claims: Mutex<()>,
    volatile_offsets: Option<Mutex<HashMap<(String, u32), u64>>>,
}

impl FileLog {
    pub async fn open(dir: impl AsRef<Path>, partitions: u32) -> Result<Self> {
        if partitions == 0 {
            return Err(TallyError::Validation(
                "a log needs at least one partition".to_string(),
            ));
        }
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir).await?;

        let mut writers = Vec::with_capacity(partitions as usize);
        for partition in 0..partitions {
            let path = partition_path(&dir, partition);
            let (complete, valid_len) = scan_complete_lines(&path).await?;
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await?;
            if file.metadata().await?.len() > valid_len {
                warn!(
                    path = %path.display(),
                    "discarding incomplete trailing entry"
                );
                file.set_len(valid_len).await?;
            }
            writers.push(Mutex::new(PartitionWriter {
                path,
                file,
                len: valid_len,
                next_offset: complete,
                poisoned: false,
            }));
        }

        Ok(Self {
            dir,
            writers,
            claims: Mutex::new(()),
            volatile_offsets: None,
        })
    }

    /// Keep committed offsets in memory only, so every open of the log
    /// starts consumers from the beginning. For pairing with a store that
    /// does not outlive the process.
    pub fn with_volatile_commits(mut self) -> Self {
        info!(dir = %self.dir.display(), "committed offsets will not be persisted");
        self.volatile_offsets = Some(Mutex::new(HashMap::new()));
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn group_path(&self, group: &str, file_name: String) -> Result<PathBuf> {
        if group.is_empty() || group.contains(['/', '\\']) || group.starts_with('.') {
            return Err(TallyError::Validation(format!(
                "invalid consumer group name {group:?}"
            )));
        }
        Ok(self.dir.join("groups").join(group).join(file_name))
    }

    fn offset_path(&self, group: &str, partition: u32) -> Result<PathBuf> {
        self.group_path(group, format!("partition-{partition}.offset"))
    }

    fn lease_path(&self, group: &str, partition: u32) -> Result<PathBuf> {
        self.group_path(group, format!("partition-{partition}.lease"))
    }
}

/// Cross-process mutex around one lease file, held only while it is read
/// and rewritten.
#[derive(Debug)]
struct LeaseLockGuard {
    path: PathBuf,
}

impl LeaseLockGuard {
    async fn acquire(lease_path: &Path) -> Result<Self> {
        let path = sibling(lease_path, ".lock");
        for _ in 0..LEASE_LOCK_ATTEMPTS {
            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(_) => return Ok(Self { path }),
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                    if lock_is_stale(&path).await {
                        warn!(path = %path.display(), "removing stale lease lock");
                        try_remove_file(&path).await?;
                        continue;
                    }
                    tokio::time::sleep(LEASE_LOCK_RETRY).await;
                }
                Err(err) => return Err(TallyError::Io(err)),
            }
        }
        Err(TallyError::StorageUnavailable(format!(
            "lease lock {} stayed busy",
            path.display()
        )))
    }

    async fn release(self) {
        if let Err(err) = try_remove_file(&self.path).await {
            warn!(path = %self.path.display(), error = %err, "failed to release lease lock");
        }
    }
}

async fn lock_is_stale(path: &Path) -> bool {
    match tokio::fs::metadata(path).await {
        Ok(metadata) => metadata
            .modified()
            .ok()
            .and_then(|modified| modified.elapsed().ok())
            .is_some_and(|age| age >= STALE_LEASE_LOCK),
        Err(_) => false,
    }
}

async fn read_lease(path: &Path) -> Result<Option<PartitionLease>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => serde_json::from_slice(&bytes).map(Some).map_err(|err| {
            TallyError::InternalError(format!(
                "failed to parse lease {}: {err}",
                path.display()
            ))
        }),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(TallyError::Io(err)),
    }
}

async fn write_lease_if_granted(path: &Path, consumer: &str, ttl: Duration) -> Result<bool> {
    let now = now();
    if let Some(lease) = read_lease(path).await?
        && !lease.grants(consumer, now)
    {
        return Ok(false);
    }
    let lease = PartitionLease::new(consumer, now, ttl)?;
    let bytes = serde_json::to_vec(&lease)
        .map_err(|err| TallyError::InternalError(format!("failed to encode lease: {err}")))?;
    replace_file(path, &bytes).await?;
    Ok(true)
}

async fn remove_lease_if_held(path: &Path, consumer: &str) -> Result<()> {
    if read_lease(path)
        .await?
        .is_some_and(|lease| lease.consumer == consumer)
    {
        try_remove_file(path).await?;
    }
    Ok(())
}

/// Writes `bytes` to a temporary sibling, then renames it over `path`.
async fn replace_file(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp_path = sibling(path, ".tmp");
    let mut tmp = File::create(&tmp_path).await?;
    tmp.write_all(bytes).await?;
    tmp.sync_data().await?;
    drop(tmp);
    tokio::fs::rename(&tmp_path, path).await?;
    Ok(())
}

async fn try_remove_file(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(TallyError::Io(err)),
    }
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

fn partition_path(dir: &Path, partition: u32) -> PathBuf {
    dir.join(format!("partition-{partition}.log"))
}

/// Number of newline-terminated lines and the byte length they cover.
async fn scan_complete_lines(path: &Path) -> Result<(u64, u64)> {
    let file = match File::open(path).await {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok((0, 0)),
        Err(err) => return Err(err.into()),
    };
    let mut reader = BufReader::new(file);
    let mut line = Vec::new();
    let (mut lines, mut bytes) = (0u64, 0u64);
    loop {
        line.clear();
        let read = reader.read_until(b'\n', &mut line).await?;
        if read == 0 || line.last() != Some(&b'\n') {
            return Ok((lines, bytes));
        }
        lines += 1;
        bytes += read as u64;
    }
}

fn decode_line(line: &[u8]) -> String {
    let body = line.strip_suffix(b"\n").unwrap_or(line);
    serde_json::from_slice::<String>(body)
        .unwrap_or_else(|_| String::from_utf8_lossy(body).into_owned())
}

#[async_trait]
impl StreamLog for FileLog {
    fn partition_count(&self) -> u32 {
        self.writers.len() as u32
    }

    async fn append(&self, partition: u32, payload: &str) -> Result<EntryId> {
        check_partition(partition, self.partition_count())?;
        let mut line = serde_json::to_string(payload).map_err(|err| {
            TallyError::InternalError(format!("failed to encode log entry: {err}"))
        })?;
        line.push('\n');

        let mut writer = self.writers[partition as usize].lock().await;
        let offset = writer.append_line(line.as_bytes()).await?;
        Ok(EntryId::new(partition, offset))
    }

    async fn cursor_at(&self, partition: u32, offset: u64) -> Result<LogCursor> {
        check_partition(partition, self.partition_count())?;
        let mut cursor = LogCursor {
            partition,
            next_offset: 0,
            position: 0,
        };
        let file = match File::open(partition_path(&self.dir, partition)).await {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(cursor),
            Err(err) => return Err(err.into()),
        };
        let mut reader = BufReader::new(file);
        let mut line = Vec::new();
        while cursor.next_offset < offset {
            line.clear();
            let read = reader.read_until(b'\n', &mut line).await?;
            if read == 0 || line.last() != Some(&b'\n') {
                break;
            }
            cursor.next_offset += 1;
            cursor.position += read as u64;
        }
        Ok(cursor)
    }

    async fn read(&self, cursor: &mut LogCursor, max: usize) -> Result<Vec<LogRecord>> {
        check_partition(cursor.partition, self.partition_count())?;
        let mut records = Vec::new();
        if max == 0 {
            return Ok(records);
        }

        let mut file = match File::open(partition_path(&self.dir, cursor.partition)).await {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(records),
            Err(err) => return Err(err.into()),
        };
        file.seek(SeekFrom::Start(cursor.position)).await?;
        let mut reader = BufReader::new(file);
        let mut line = Vec::new();
        while records.len() < max {
            line.clear();
            let read = reader.read_until(b'\n', &mut line).await?;
            if read == 0 || line.last() != Some(&b'\n') {
                break;
            }
            records.push(LogRecord {
                id: EntryId::new(cursor.partition, cursor.next_offset),
                payload: decode_line(&line),
                start: *cursor,
            });
            cursor.next_offset += 1;
            cursor.position += read as u64;
        }
        Ok(records)
    }

    async fn committed(&self, group: &str, partition: u32) -> Result<Option<u64>> {
        check_partition(partition, self.partition_count())?;
        let path = self.offset_path(group, partition)?;
        if let Some(offsets) = &self.volatile_offsets {
            return Ok(offsets
                .lock()
                .await
                .get(&(group.to_string(), partition))
                .copied());
        }
        match tokio::fs::read_to_string(&path).await {
            Ok(text) => text.trim().parse::<u64>().map(Some).map_err(|err| {
                TallyError::InternalError(format!(
                    "failed to parse committed offset {}: {err}",
                    path.display()
                ))
            }),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(TallyError::Io(err)),
        }
    }

    async fn commit(&self, group: &str, partition: u32, offset: u64) -> Result<()> {
        check_partition(partition, self.partition_count())?;
        let path = self.offset_path(group, partition)?;
        if let Some(offsets) = &self.volatile_offsets {
            offsets
                .lock()
                .await
                .insert((group.to_string(), partition), offset);
            return Ok(());
        }
        replace_file(&path, offset.to_string().as_bytes()).await
    }

    async fn claim(
        &self,
        group: &str,
        partition: u32,
        consumer: &str,
        ttl: Duration,
    ) -> Result<bool> {
        check_partition(partition, self.partition_count())?;
        let path = self.lease_path(group, partition)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let _local = self.claims.lock().await;
        let lock = LeaseLockGuard::acquire(&path).await?;
        let claimed = write_lease_if_granted(&path, consumer, ttl).await;
        lock.release().await;
        claimed
    }

    async fn release(&self, group: &str, partition: u32, consumer: &str) -> Result<()> {
        check_partition(partition, self.partition_count())?;
        let path = self.lease_path(group, partition)?;
        if !tokio::fs::try_exists(&path).await? {
            return Ok(());
        }

        let _local = self.claims.lock().await;
        let lock = LeaseLockGuard::acquire(&path).await?;
        let released = remove_lease_if_held(&path, consumer).await;
        lock.release().await;
        released
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::{fs::File, io::AsyncWriteExt};

    use super::{FileLog, partition_path, sibling};
    use crate::log::{EntryId, StreamLog};

    async fn payloads(log: &FileLog, partition: u32) -> Vec<String> {
        let mut cursor = log.cursor_at(partition, 0).await.unwrap();
        log.read(&mut cursor, 100)
            .await
            .unwrap()
            .into_iter()
            .map(|record| record.payload)
            .collect()
    }

    #[tokio::test]
    async fn entries_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let log = FileLog::open(dir.path(), 2).await.unwrap();
            assert_eq!(log.append(0, "first").await.unwrap(), EntryId::new(0, 0));
            assert_eq!(log.append(0, "second\nline").await.unwrap(), EntryId::new(0, 1));
            assert_eq!(log.append(1, "other").await.unwrap(), EntryId::new(1, 0));
        }

        let log = FileLog::open(dir.path(), 2).await.unwrap();
        assert_eq!(log.append(0, "third").await.unwrap(), EntryId::new(0, 2));

        let mut cursor = log.cursor_at(0, 0).await.unwrap();
        let records = log.read(&mut cursor, 10).await.unwrap();
        let payloads: Vec<_> = records.iter().map(|r| r.payload.as_str()).collect();
        assert_eq!(payloads, vec!["first", "second\nline", "third"]);
        assert_eq!(records[2].id, EntryId::new(0, 2));
        assert!(log.read(&mut cursor, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn cursor_at_skips_to_offset_and_rewinds() {
        let dir = tempfile::tempdir().unwrap();
        let log = FileLog::open(dir.path(), 1).await.unwrap();
        for n in 0..5 {
            log.append(0, &format!("entry-{n}")).await.unwrap();
        }

        let mut cursor = log.cursor_at(0, 3).await.unwrap();
        let records = log.read(&mut cursor, 1).await.unwrap();
        assert_eq!(records[0].payload, "entry-3");

        let mut rewound = records[0].start;
        let again = log.read(&mut rewound, 5).await.unwrap();
        assert_eq!(again.len(), 2);
        assert_eq!(again[0].id, EntryId::new(0, 3));
    }

    #[tokio::test]
    async fn incomplete_trailing_line_is_discarded_on_open() {
        let dir = tempfile::tempdir().unwrap();
        {
            let log = FileLog::open(dir.path(), 1).await.unwrap();
            log.append(0, "whole").await.unwrap();
        }
        let mut file = tokio::fs::OpenOptions::new()
            .append(true)
            .open(partition_path(dir.path(), 0))
            .await
            .unwrap();
        file.write_all(b"\"torn").await.unwrap();
        drop(file);

        let log = FileLog::open(dir.path(), 1).await.unwrap();
        assert_eq!(log.append(0, "next").await.unwrap(), EntryId::new(0, 1));
        let mut cursor = log.cursor_at(0, 0).await.unwrap();
        let records = log.read(&mut cursor, 10).await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].payload, "next");
    }

    #[tokio::test]
    async fn committed_offsets_are_per_group_and_persist() {
        let dir = tempfile::tempdir().unwrap();
        {
            let log = FileLog::open(dir.path(), 2).await.unwrap();
            assert_eq!(log.committed("aggregators", 0).await.unwrap(), None);
            log.commit("aggregators", 0, 41).await.unwrap();
            log.commit("aggregators", 0, 42).await.unwrap();
            log.commit("audit", 1, 7).await.unwrap();
        }

        let log = FileLog::open(dir.path(), 2).await.unwrap();
        assert_eq!(log.committed("aggregators", 0).await.unwrap(), Some(42));
        assert_eq!(log.committed("aggregators", 1).await.unwrap(), None);
        assert_eq!(log.committed("audit", 1).await.unwrap(), Some(7));
        assert!(log.commit("../escape", 0, 1).await.is_err());
        assert!(log.append(2, "nope").await.is_err());
    }

    #[tokio::test]
    async fn rollback_cuts_a_partial_write() {
        let dir = tempfile::tempdir().unwrap();
        let log = FileLog::open(dir.path(), 1).await.unwrap();
        log.append(0, "whole").await.unwrap();

        {
            let mut writer = log.writers[0].lock().await;
            writer.file.write_all(b"\"half-writ").await.unwrap();
            writer.file.flush().await.unwrap();
            writer.rollback().await;
            assert!(!writer.poisoned);
            let len = tokio::fs::metadata(&writer.path).await.unwrap().len();
            assert_eq!(len, writer.len);
        }

        assert_eq!(log.append(0, "next").await.unwrap(), EntryId::new(0, 1));
        assert_eq!(payloads(&log, 0).await, vec!["whole", "next"]);
    }

    #[tokio::test]
    async fn failed_write_that_cannot_be_undone_blocks_appends() {
        let dir = tempfile::tempdir().unwrap();
        let log = FileLog::open(dir.path(), 1).await.unwrap();
        log.append(0, "whole").await.unwrap();
        {
            let mut writer = log.writers[0].lock().await;
            writer.file = File::open(partition_path(dir.path(), 0)).await.unwrap();
        }

        assert!(log.append(0, "lost").await.is_err());
        assert!(log.writers[0].lock().await.poisoned);
        assert!(log.append(0, "refused").await.is_err());

        let reopened = FileLog::open(dir.path(), 1).await.unwrap();
        assert_eq!(reopened.append(0, "after").await.unwrap(), EntryId::new(0, 1));
        assert_eq!(payloads(&reopened, 0).await, vec!["whole", "after"]);
    }

    #[tokio::test]
    async fn appends_through_two_handles_get_distinct_offsets() {
        let dir = tempfile::tempdir().unwrap();
        let first = FileLog::open(dir.path(), 1).await.unwrap();
        let second = FileLog::open(dir.path(), 1).await.unwrap();

        assert_eq!(first.append(0, "a").await.unwrap(), EntryId::new(0, 0));
        assert_eq!(second.append(0, "b").await.unwrap(), EntryId::new(0, 1));
        assert_eq!(first.append(0, "c").await.unwrap(), EntryId::new(0, 2));
        assert_eq!(payloads(&second, 0).await, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn volatile_commits_do_not_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let log = FileLog::open(dir.path(), 1)
                .await
                .unwrap()
                .with_volatile_commits();
            log.append(0, "entry").await.unwrap();
            log.commit("aggregator", 0, 0).await.unwrap();
            assert_eq!(log.committed("aggregator", 0).await.unwrap(), Some(0));
        }

        let log = FileLog::open(dir.path(), 1).await.unwrap();
        assert_eq!(log.committed("aggregator", 0).await.unwrap(), None);
        assert!(!dir.path().join("groups").exists());
    }

    #[tokio::test]
    async fn leases_exclude_other_consumers_across_handles() {
        let dir = tempfile::tempdir().unwrap();
        let first = FileLog::open(dir.path(), 2).await.unwrap();
        let second = FileLog::open(dir.path(), 2).await.unwrap();
        let ttl = Duration::from_secs(30);

        assert!(first.claim("aggregator", 0, "agg-a", ttl).await.unwrap());
        assert!(!second.claim("aggregator", 0, "agg-b", ttl).await.unwrap());
        assert!(second.claim("aggregator", 1, "agg-b", ttl).await.unwrap());
        assert!(second.claim("audit", 0, "agg-b", ttl).await.unwrap());
        assert!(first.claim("aggregator", 0, "agg-a", ttl).await.unwrap());

        second.release("aggregator", 0, "agg-b").await.unwrap();
        assert!(!second.claim("aggregator", 0, "agg-b", ttl).await.unwrap());
        first.release("aggregator", 0, "agg-a").await.unwrap();
        assert!(second.claim("aggregator", 0, "agg-b", ttl).await.unwrap());
        assert!(second.release("../escape", 0, "agg-b").await.is_err());
    }

    #[tokio::test]
    async fn expired_lease_and_stale_lock_do_not_block_a_claim() {
        let dir = tempfile::tempdir().unwrap();
        let log = FileLog::open(dir.path(), 1).await.unwrap();
        assert!(
            log.claim("aggregator", 0, "agg-a", Duration::from_millis(20))
                .await
                .unwrap()
        );
        tokio::time::sleep(Duration::from_millis(40)).await;

        let lock_path = sibling(&log.lease_path("aggregator", 0).unwrap(), ".lock");
        let lock = std::fs::File::create(&lock_path).unwrap();
        lock.set_modified(std::time::SystemTime::now() - Duration::from_secs(60))
            .unwrap();
        drop(lock);

        assert!(
            log.claim("aggregator", 0, "agg-b", Duration::from_secs(30))
                .await
                .unwrap()
        );
        assert!(!lock_path.exists());
        assert!(
            !log.claim("aggregator", 0, "agg-a", Duration::from_secs(30))
                .await
                .unwrap()
        );
    }
}
