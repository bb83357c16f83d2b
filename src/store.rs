use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use fs2::FileExt;
use serde::{Deserialize, Serialize};

use crate::error::{GameError, Result};

const LOCK_FILE: &str = ".lock";
const JOURNAL: &str = "pending.json";
const HISTORY: &str = "history.jsonl";
const STAGED_SUFFIX: &str = ".tmp";
const RETRY_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

// One step of a commit, in the order it gets applied
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(tag = "op", content = "record", rename_all = "lowercase")]
enum Change {
    Put(String),
    Remove(String),
}

fn validate_game_name(name: &str) -> Result<()> {
    let well_formed = !name.is_empty()
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if well_formed {
        Ok(())
    } else {
        Err(GameError::InvalidGameName(name.to_string()))
    }
}

/// Directory holding the flat records of one game.
#[derive(Clone, Debug)]
pub struct GameDir {
    name: String,
    path: PathBuf,
}

impl GameDir {
    pub fn create(games_dir: &Path, name: &str) -> Result<Self> {
        validate_game_name(name)?;
        fs::create_dir_all(games_dir).map_err(|e| GameError::io(games_dir, e))?;

        let path = games_dir.join(name);
        match fs::create_dir(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => return Err(GameError::GameExists(name.to_string())),
            Err(e) => return Err(GameError::io(&path, e)),
        }

        log::debug!("Created game directory {}", path.display());
        Ok(GameDir { name: name.to_string(), path })
    }

    pub fn open(games_dir: &Path, name: &str) -> Result<Self> {
        validate_game_name(name)?;
        let path = games_dir.join(name);
        if !path.is_dir() {
            return Err(GameError::NoSuchGame(name.to_string()));
        }
        Ok(GameDir { name: name.to_string(), path })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn record_path(&self, record: &str) -> PathBuf {
        self.path.join(format!("{}.txt", record))
    }

    fn staged_path(&self, record: &str) -> PathBuf {
        self.path.join(format!("{}.txt{}", record, STAGED_SUFFIX))
    }

    fn journal_path(&self) -> PathBuf {
        self.path.join(JOURNAL)
    }

    /// Take the game lock, waiting at most `timeout` in total. Any commit left
    /// behind by a crashed process is rolled forward before the lock is handed
    /// out. When that roll-forward fails it is retried by the next holder.
    pub fn lock(&self, mode: LockMode, timeout: Duration) -> Result<GameLock<'_>> {
        let deadline = Instant::now() + timeout;
        let mut settled = true;
        loop {
            let lock = self.acquire(mode, deadline, timeout)?;
            if mode == LockMode::Exclusive {
                lock.recover()?;
                return Ok(lock);
            }
            if !settled || !self.journal_path().exists() {
                return Ok(lock);
            }

            // Recovery writes, so a shared holder has to step up first
            drop(lock);
            settled = self.acquire(LockMode::Exclusive, deadline, timeout)?.recover()?;
        }
    }

    fn acquire(&self, mode: LockMode, deadline: Instant, timeout: Duration) -> Result<GameLock<'_>> {
        let lock_path = self.path.join(LOCK_FILE);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)
            .map_err(|e| GameError::io(&lock_path, e))?;

        loop {
            // Called through the trait, std has inherent methods of the same names
            let attempt = match mode {
                LockMode::Shared => FileExt::try_lock_shared(&file),
                LockMode::Exclusive => FileExt::try_lock_exclusive(&file),
            };

            match attempt {
                Ok(()) => break,
                Err(e) if is_contended(&e) => {
                    if Instant::now() >= deadline {
                        log::debug!("Gave up on {:?} lock of {} after {:?}", mode, self.name, timeout);
                        return Err(GameError::GameBusy(timeout.as_millis()));
                    }
                    thread::sleep(RETRY_INTERVAL);
                }
                Err(e) => return Err(GameError::io(&lock_path, e)),
            }
        }

        log::debug!("Acquired {:?} lock of {}", mode, self.name);
        Ok(GameLock { dir: self, file, mode })
    }
}

fn is_contended(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
        || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

fn write_synced(path: &Path, contents: &[u8]) -> Result<()> {
    let mut file = File::create(path).map_err(|e| GameError::io(path, e))?;
    file.write_all(contents).map_err(|e| GameError::io(path, e))?;
    file.sync_all().map_err(|e| GameError::io(path, e))
}

#[cfg(unix)]
fn sync_dir(path: &Path) -> Result<()> {
    File::open(path)
        .and_then(|dir| dir.sync_all())
        .map_err(|e| GameError::io(path, e))
}

#[cfg(not(unix))]
fn sync_dir(_path: &Path) -> Result<()> {
    Ok(())
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(GameError::io(path, e)),
    }
}

/// A held game lock. Released when dropped, on every exit path.
pub struct GameLock<'a> {
    dir: &'a GameDir,
    file: File,
    mode: LockMode,
}

impl Drop for GameLock<'_> {
    fn drop(&mut self) {
        if let Err(err) = FileExt::unlock(&self.file) {
            log::warn!("Failed to release lock of {}: {}", self.dir.name, err);
        } else {
            log::debug!("Released {:?} lock of {}", self.mode, self.dir.name);
        }
    }
}

impl<'a> GameLock<'a> {
    /// Contents of a record, `None` when it doesn't exist.
    pub fn read(&self, record: &str) -> Result<Option<String>> {
        let path = self.dir.record_path(record);
        match fs::read_to_string(&path) {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(GameError::io(&path, e)),
        }
    }

    pub fn transaction(&self) -> Transaction<'_, 'a> {
        debug_assert_eq!(self.mode, LockMode::Exclusive, "writes need the exclusive lock");
        Transaction { lock: self, changes: BTreeMap::new() }
    }

    /// Append one entry to the play log. The log is informational, so a failed
    /// append only warns.
    pub fn append_history<T: Serialize>(&self, entry: &T) {
        let path = self.dir.path.join(HISTORY);
        let file = match OpenOptions::new().create(true).append(true).open(&path) {
            Ok(file) => file,
            Err(err) => {
                log::warn!("Could not open play log {}: {}", path.display(), err);
                return;
            }
        };

        let mut writer = BufWriter::new(file);
        if let Err(err) = jsonl::write(&mut writer, entry) {
            log::warn!("Could not append to play log {}: {:?}", path.display(), err);
        } else if let Err(err) = writer.flush() {
            log::warn!("Could not flush play log {}: {}", path.display(), err);
        }
    }

    // Finish a commit interrupted by a crash and sweep staged files that never
    // made it into a journal. False when the journal could not be applied and
    // is still waiting, along with its staged records.
    fn recover(&self) -> Result<bool> {
        let journal_path = self.dir.journal_path();
        match fs::read_to_string(&journal_path) {
            Ok(text) => {
                let changes: Vec<Change> = serde_json::from_str(&text)
                    .map_err(|e| GameError::malformed("pending", e.to_string()))?;
                log::warn!("Rolling forward an interrupted commit of {} ({} changes)", self.dir.name, changes.len());
                if let Err(err) = self.apply(&changes) {
                    log::warn!("Could not roll forward {}, keeping its journal: {}", self.dir.name, err);
                    return Ok(false);
                }
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(GameError::io(&journal_path, e)),
        }

        let entries = fs::read_dir(&self.dir.path).map_err(|e| GameError::io(&self.dir.path, e))?;
        for entry in entries {
            let entry = entry.map_err(|e| GameError::io(&self.dir.path, e))?;
            if entry.file_name().to_string_lossy().ends_with(STAGED_SUFFIX) {
                log::warn!("Discarding stray staged record {}", entry.path().display());
                remove_if_exists(&entry.path())?;
            }
        }

        Ok(true)
    }

    // Idempotent, recovery may replay a partially applied journal
    fn apply(&self, changes: &[Change]) -> Result<()> {
        for change in changes {
            match change {
                Change::Put(record) => {
                    let staged = self.dir.staged_path(record);
                    let target = self.dir.record_path(record);
                    if staged.exists() {
                        fs::rename(&staged, &target).map_err(|e| GameError::io(&target, e))?;
                    }
                }
                Change::Remove(record) => remove_if_exists(&self.dir.record_path(record))?,
            }
        }
        sync_dir(&self.dir.path)?;
        remove_if_exists(&self.dir.journal_path())?;
        sync_dir(&self.dir.path)
    }
}

/// Record writes that become visible together or not at all.
pub struct Transaction<'l, 'a> {
    lock: &'l GameLock<'a>,
    changes: BTreeMap<String, Option<String>>,
}

impl Transaction<'_, '_> {
    pub fn put(&mut self, record: &str, contents: String) {
        self.changes.insert(record.to_string(), Some(contents));
    }

    pub fn remove(&mut self, record: &str) {
        self.changes.insert(record.to_string(), None);
    }

    /// Stage every record next to its target, make the journal durable, then
    /// swap records into place. The durable journal is the commit point: an
    /// error before it leaves the old state, while a crash or failed rename
    /// after it is rolled forward by the next lock holder.
    pub fn commit(self) -> Result<()> {
        if self.changes.is_empty() {
            return Ok(());
        }
        let dir = self.lock.dir;

        let mut journal: Vec<Change> = Vec::with_capacity(self.changes.len());
        for (record, contents) in &self.changes {
            match contents {
                Some(contents) => {
                    if let Err(err) = write_synced(&dir.staged_path(record), contents.as_bytes()) {
                        self.discard_staged();
                        return Err(err);
                    }
                    journal.push(Change::Put(record.clone()));
                }
                None => journal.push(Change::Remove(record.clone())),
            }
        }

        let encoded = serde_json::to_vec_pretty(&journal)
            .map_err(|e| GameError::malformed("pending", e.to_string()))?;
        let journal_path = dir.journal_path();
        let staged_journal = dir.path.join(format!("{}{}", JOURNAL, STAGED_SUFFIX));
        let durable = write_synced(&staged_journal, &encoded)
            .and_then(|()| fs::rename(&staged_journal, &journal_path).map_err(|e| GameError::io(&journal_path, e)))
            .and_then(|()| sync_dir(&dir.path));
        if let Err(err) = durable {
            let _ = remove_if_exists(&staged_journal);
            let _ = remove_if_exists(&journal_path);
            self.discard_staged();
            return Err(err);
        }

        log::debug!("Journaled {} changes for {}", journal.len(), dir.name);
        if let Err(err) = self.lock.apply(&journal) {
            log::warn!("Commit to {} left for the next lock holder to finish: {}", dir.name, err);
        }
        Ok(())
    }

    fn discard_staged(&self) {
        for record in self.changes.keys() {
            let _ = remove_if_exists(&self.lock.dir.staged_path(record));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_millis(200);

    fn game() -> (tempfile::TempDir, GameDir) {
        let root = tempfile::tempdir().unwrap();
        let dir = GameDir::create(root.path(), "table").unwrap();
        (root, dir)
    }

    #[test]
    fn test_create_and_open() {
        let (root, dir) = game();
        assert_eq!(dir.name(), "table");
        assert!(matches!(GameDir::create(root.path(), "table"), Err(GameError::GameExists(_))));
        assert!(GameDir::open(root.path(), "table").is_ok());
        assert!(matches!(GameDir::open(root.path(), "other"), Err(GameError::NoSuchGame(_))));
        assert!(matches!(GameDir::open(root.path(), "../x"), Err(GameError::InvalidGameName(_))));
    }

    #[test]
    fn test_commit_puts_and_removes() {
        let (_root, dir) = game();
        fs::write(dir.record_path("old"), "gone").unwrap();

        let lock = dir.lock(LockMode::Exclusive, TIMEOUT).unwrap();
        let mut tx = lock.transaction();
        tx.put("turn", "admin".to_string());
        tx.put("deck", "H2\n".to_string());
        tx.remove("old");
        tx.commit().unwrap();

        assert_eq!(lock.read("turn").unwrap().as_deref(), Some("admin"));
        assert_eq!(lock.read("deck").unwrap().as_deref(), Some("H2\n"));
        assert_eq!(lock.read("old").unwrap(), None);
        assert!(!dir.journal_path().exists());
        assert!(!dir.staged_path("turn").exists());
    }

    #[test]
    fn test_interrupted_commit_rolls_forward() {
        let (_root, dir) = game();
        fs::write(dir.record_path("turn"), "admin").unwrap();
        fs::write(dir.record_path("bob"), "H2\n").unwrap();

        // State a process dying right after its journal landed leaves behind
        fs::write(dir.staged_path("turn"), "alice,0").unwrap();
        let journal = vec![Change::Put("turn".to_string()), Change::Remove("bob".to_string())];
        fs::write(dir.journal_path(), serde_json::to_vec(&journal).unwrap()).unwrap();

        let lock = dir.lock(LockMode::Shared, TIMEOUT).unwrap();
        assert_eq!(lock.read("turn").unwrap().as_deref(), Some("alice,0"));
        assert_eq!(lock.read("bob").unwrap(), None);
        assert!(!dir.journal_path().exists());
    }

    #[test]
    fn test_staged_records_without_journal_are_dropped() {
        let (_root, dir) = game();
        fs::write(dir.record_path("turn"), "admin").unwrap();
        fs::write(dir.staged_path("turn"), "alice,0").unwrap();

        let lock = dir.lock(LockMode::Exclusive, TIMEOUT).unwrap();
        assert_eq!(lock.read("turn").unwrap().as_deref(), Some("admin"));
        assert!(!dir.staged_path("turn").exists());
    }

    #[test]
    fn test_failed_rename_after_journal_still_commits() {
        let (_root, dir) = game();
        fs::write(dir.record_path("turn"), "admin").unwrap();
        // Nothing can be renamed over a directory
        fs::create_dir(dir.record_path("zed")).unwrap();
        fs::write(dir.record_path("zed").join("keep"), "x").unwrap();

        {
            let lock = dir.lock(LockMode::Exclusive, TIMEOUT).unwrap();
            let mut tx = lock.transaction();
            tx.put("turn", "alice,0".to_string());
            tx.put("zed", "H2\n".to_string());
            assert!(tx.commit().is_ok());
            assert_eq!(lock.read("turn").unwrap().as_deref(), Some("alice,0"));
        }
        assert!(dir.journal_path().exists());

        // Later holders still get in, and the staged record is kept for them
        assert!(dir.lock(LockMode::Exclusive, TIMEOUT).is_ok());
        assert!(dir.lock(LockMode::Shared, TIMEOUT).is_ok());
        assert!(dir.journal_path().exists());
        assert!(dir.staged_path("zed").exists());

        fs::remove_dir_all(dir.record_path("zed")).unwrap();
        let lock = dir.lock(LockMode::Shared, TIMEOUT).unwrap();
        assert_eq!(lock.read("zed").unwrap().as_deref(), Some("H2\n"));
        assert_eq!(lock.read("turn").unwrap().as_deref(), Some("alice,0"));
        assert!(!dir.journal_path().exists());
    }

    #[test]
    fn test_reader_recovery_stays_within_timeout() {
        let (_root, dir) = game();
        let _reader = dir.lock(LockMode::Shared, TIMEOUT).unwrap();
        fs::write(dir.staged_path("turn"), "alice,0").unwrap();
        let journal = vec![Change::Put("turn".to_string())];
        fs::write(dir.journal_path(), serde_json::to_vec(&journal).unwrap()).unwrap();

        // Stepping up to roll the journal forward waits on the other reader
        let started = Instant::now();
        assert!(matches!(dir.lock(LockMode::Shared, TIMEOUT), Err(GameError::GameBusy(200))));
        assert!(started.elapsed() < TIMEOUT * 2);
    }

    #[test]
    fn test_busy_lock_times_out() {
        let (_root, dir) = game();
        let held = dir.lock(LockMode::Exclusive, TIMEOUT).unwrap();
        assert!(matches!(
            dir.lock(LockMode::Exclusive, Duration::from_millis(50)),
            Err(GameError::GameBusy(50))
        ));
        assert!(matches!(dir.lock(LockMode::Shared, Duration::from_millis(50)), Err(GameError::GameBusy(_))));

        drop(held);
        assert!(dir.lock(LockMode::Exclusive, TIMEOUT).is_ok());
    }

    #[test]
    fn test_readers_share_the_lock() {
        let (_root, dir) = game();
        let first = dir.lock(LockMode::Shared, TIMEOUT).unwrap();
        let second = dir.lock(LockMode::Shared, TIMEOUT).unwrap();
        assert_eq!(first.mode, LockMode::Shared);
        assert_eq!(second.mode, LockMode::Shared);
        assert!(matches!(
            dir.lock(LockMode::Exclusive, Duration::from_millis(50)),
            Err(GameError::GameBusy(_))
        ));
    }

    #[test]
    fn test_history_appends_lines() {
        let (_root, dir) = game();
        let lock = dir.lock(LockMode::Exclusive, TIMEOUT).unwrap();
        lock.append_history(&serde_json::json!({"action": "start"}));
        lock.append_history(&serde_json::json!({"action": "draw"}));

        let text = fs::read_to_string(dir.path().join(HISTORY)).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[1].contains("draw"));
    }
}
