//! Experiment run store.
//!
//! Owns one run's directory tree, its trigger/image counters, the append-only
//! CSV log, and the durable state record. The store is the single writer of
//! all persisted run state; every mutating operation persists before it
//! returns, so a crash loses at most the one in-flight event.
//!
//! # Run directory layout
//!
//! ```text
//! base_dir/Run_<YYYYMMDD_HHMMSS>/
//!     photos/<DDMMYYYY>_<NNNNN>.<ext>
//!     log.csv      timestamp,trigger_index,gate_state,captured,filename
//!     state.json   {next_image_index, next_trigger_index, run_dir, updated}
//! ```
//!
//! # Counter semantics
//!
//! `next_trigger_index` advances on every accepted edge, gated or not.
//! `next_image_index` advances only after a capture is confirmed on disk, so
//! a failed capture reuses its index and numbering never gaps or overwrites.
//! Both are monotonically non-decreasing for the life of the run.
//!
//! The state record is written to a temporary file and atomically renamed
//! over the canonical name; a reader sees either the old complete record or
//! the new complete record, never a truncated mix. If the record is missing
//! or corrupt the counters are rebuilt by inspection: the image index from
//! the highest-numbered photo on disk, the trigger index from the last data
//! row of the log.

use chrono::{DateTime, Local, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::error::{AppResult, CaptureError};

/// Run directory names: `Run_YYYYMMDD_HHMMSS`, optionally suffixed when two
/// runs start within the same second.
static RUN_DIR_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^Run_\d{8}_\d{6}(_\d+)?$").expect("static pattern"));

/// Column order of the run log.
const LOG_HEADER: [&str; 5] = [
    "timestamp",
    "trigger_index",
    "gate_state",
    "captured",
    "filename",
];

/// Whether to reuse the latest existing run or start a fresh one.
#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum RunMode {
    /// Continue the most recently modified run directory, or create one if
    /// none exists.
    Resume,
    /// Always create a new, uniquely timestamped run directory.
    Restart,
}

/// Paths identifying one experiment run. Immutable after creation.
#[derive(Clone, Debug)]
pub struct RunContext {
    /// The run's root directory.
    pub run_dir: PathBuf,
    /// Saved images.
    pub photos_dir: PathBuf,
    /// Append-only trigger log.
    pub log_path: PathBuf,
    /// Durable counter record.
    pub state_path: PathBuf,
}

impl RunContext {
    fn new(run_dir: PathBuf) -> Self {
        Self {
            photos_dir: run_dir.join("photos"),
            log_path: run_dir.join("log.csv"),
            state_path: run_dir.join("state.json"),
            run_dir,
        }
    }
}

/// Durable counter record, serialized as `state.json`.
#[derive(Debug, Serialize, Deserialize)]
struct StateRecord {
    next_image_index: u64,
    next_trigger_index: u64,
    run_dir: String,
    updated: DateTime<Utc>,
}

/// One row of the run log.
#[derive(Clone, Debug)]
pub struct LogRow {
    /// Event timestamp.
    pub timestamp: DateTime<Local>,
    /// Trigger index the row belongs to.
    pub trigger_index: u64,
    /// Gate level at the edge.
    pub gate_high: bool,
    /// Whether an image was saved for this event.
    pub captured: bool,
    /// Saved filename; empty when not captured.
    pub filename: String,
    /// Failure or skip detail. Emitted on the structured log, not the CSV.
    pub message: String,
}

impl LogRow {
    /// Row for a successfully captured event.
    pub fn captured(trigger_index: u64, at: DateTime<Local>, filename: &str) -> Self {
        Self {
            timestamp: at,
            trigger_index,
            gate_high: true,
            captured: true,
            filename: filename.to_string(),
            message: String::new(),
        }
    }

    /// Row for an event suppressed by a low gate.
    pub fn gated_off(trigger_index: u64, at: DateTime<Local>) -> Self {
        Self {
            timestamp: at,
            trigger_index,
            gate_high: false,
            captured: false,
            filename: String::new(),
            message: "not captured, gate low".to_string(),
        }
    }

    /// Row for a gated-on event whose capture failed.
    pub fn failed(trigger_index: u64, at: DateTime<Local>, message: String) -> Self {
        Self {
            timestamp: at,
            trigger_index,
            gate_high: true,
            captured: false,
            filename: String::new(),
            message,
        }
    }
}

/// Store for one experiment run's counters, log, and directories.
pub struct ExperimentStore {
    ctx: RunContext,
    next_image_index: u64,
    next_trigger_index: u64,
    image_ext: String,
    image_file_re: Regex,
}

impl ExperimentStore {
    /// Open (or create) a run under `base_dir`.
    ///
    /// `Restart` always creates a fresh run directory; `Resume` reuses the
    /// most recently modified matching directory, falling back to a fresh
    /// one. The photos directory and CSV header are created as needed, and
    /// the counters are loaded, reset, or rebuilt according to the mode.
    pub fn open(base_dir: &Path, mode: RunMode, image_ext: &str) -> AppResult<Self> {
        fs::create_dir_all(base_dir)?;

        let run_dir = match mode {
            RunMode::Restart => create_new_run_dir(base_dir)?,
            RunMode::Resume => match find_latest_run_dir(base_dir)? {
                Some(existing) => existing,
                None => create_new_run_dir(base_dir)?,
            },
        };

        let ctx = RunContext::new(run_dir);
        fs::create_dir_all(&ctx.photos_dir)?;

        let image_file_re = Regex::new(&format!(r"_(\d{{5}})\.{}$", regex::escape(image_ext)))
            .map_err(|e| CaptureError::StateCorrupt(format!("bad image extension: {e}")))?;

        let mut store = Self {
            ctx,
            next_image_index: 1,
            next_trigger_index: 1,
            image_ext: image_ext.to_string(),
            image_file_re,
        };

        match mode {
            RunMode::Restart => store.persist_state()?,
            RunMode::Resume => store.load_or_rebuild_state()?,
        }
        store.ensure_log_header()?;
        Ok(store)
    }

    /// Paths of this run.
    pub fn context(&self) -> &RunContext {
        &self.ctx
    }

    /// Trigger index the next accepted edge will receive.
    pub fn next_trigger_index(&self) -> u64 {
        self.next_trigger_index
    }

    /// Image index the next successful capture will consume.
    pub fn next_image_index(&self) -> u64 {
        self.next_image_index
    }

    /// Consume one trigger index for an accepted edge.
    ///
    /// Every call returns a unique, strictly increasing index and persists
    /// before returning, regardless of the gate state or whether a capture
    /// will follow.
    pub fn allocate_trigger(&mut self, gate_high: bool) -> AppResult<u64> {
        let index = self.next_trigger_index;
        self.next_trigger_index += 1;
        self.persist_state()?;
        info!(trigger_index = index, gate_high, "trigger allocated");
        Ok(index)
    }

    /// Path and index the next successful capture should use.
    ///
    /// Does not mutate state: repeated calls return the same index until
    /// [`Self::commit_capture_success`] runs, so callers must resolve at
    /// most one pending capture at a time.
    pub fn next_image_path(&self) -> (PathBuf, u64) {
        let index = self.next_image_index;
        let stem = self.image_stem(index);
        let path = self
            .ctx
            .photos_dir
            .join(format!("{stem}.{}", self.image_ext));
        (path, index)
    }

    /// Filename stem for image `index`: `<DDMMYYYY>_<NNNNN>`.
    pub fn image_stem(&self, index: u64) -> String {
        format!("{}_{index:05}", Local::now().format("%d%m%Y"))
    }

    /// Advance the image counter after a capture is confirmed on disk.
    ///
    /// Must be called if and only if the file at the previously returned
    /// path is known to exist.
    pub fn commit_capture_success(&mut self) -> AppResult<()> {
        self.next_image_index += 1;
        self.persist_state()
    }

    /// Append one row to the run log and flush it.
    pub fn append_log_row(&mut self, row: &LogRow) -> AppResult<()> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.ctx.log_path)?;
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(file);
        writer.write_record([
            row.timestamp.format("%Y-%m-%dT%H:%M:%S%.3f").to_string(),
            row.trigger_index.to_string(),
            u8::from(row.gate_high).to_string(),
            u8::from(row.captured).to_string(),
            row.filename.clone(),
        ])?;
        writer.flush()?;
        // The message column stays out of the CSV; it goes to the
        // structured log instead.
        if !row.message.is_empty() {
            debug!(
                trigger_index = row.trigger_index,
                message = %row.message,
                "log row detail"
            );
        }
        Ok(())
    }

    // ---------- persistence ----------

    /// Write the counter record via temp file + atomic rename.
    fn persist_state(&self) -> AppResult<()> {
        let record = StateRecord {
            next_image_index: self.next_image_index,
            next_trigger_index: self.next_trigger_index,
            run_dir: self.ctx.run_dir.display().to_string(),
            updated: Utc::now(),
        };
        let tmp = self.ctx.state_path.with_extension("json.tmp");
        let payload = serde_json::to_string_pretty(&record)
            .map_err(|e| CaptureError::StateCorrupt(e.to_string()))?;
        fs::write(&tmp, payload)?;
        fs::rename(&tmp, &self.ctx.state_path)?;
        Ok(())
    }

    /// Load the persisted counters, or rebuild them by inspection.
    fn load_or_rebuild_state(&mut self) -> AppResult<()> {
        match self.read_state_record() {
            Ok(record) => {
                // Clamp upward; the counters are 1-based by contract.
                self.next_image_index = record.next_image_index.max(1);
                self.next_trigger_index = record.next_trigger_index.max(1);
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "state record unusable, rebuilding by inspection");
                self.next_image_index = self.infer_next_image_index()?;
                self.next_trigger_index = self.infer_next_trigger_index()?;
                self.persist_state()
            }
        }
    }

    fn read_state_record(&self) -> AppResult<StateRecord> {
        let raw = fs::read_to_string(&self.ctx.state_path)?;
        serde_json::from_str(&raw).map_err(|e| CaptureError::StateCorrupt(e.to_string()))
    }

    /// Highest image index among saved photos, plus one.
    fn infer_next_image_index(&self) -> AppResult<u64> {
        let mut max_index = 0u64;
        for entry in fs::read_dir(&self.ctx.photos_dir)? {
            let entry = entry?;
            let name = entry.file_name();
            if let Some(caps) = self.image_file_re.captures(&name.to_string_lossy()) {
                if let Ok(index) = caps[1].parse::<u64>() {
                    max_index = max_index.max(index);
                }
            }
        }
        Ok(max_index + 1)
    }

    /// Trigger index of the last data row in the log, plus one.
    fn infer_next_trigger_index(&self) -> AppResult<u64> {
        if !self.ctx.log_path.exists() {
            return Ok(1);
        }
        let file = File::open(&self.ctx.log_path)?;
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_reader(file);

        let mut last = None;
        for record in reader.records() {
            let record = match record {
                Ok(r) => r,
                // A torn final line must not block recovery.
                Err(_) => continue,
            };
            if let Some(index) = record.get(1).and_then(|f| f.parse::<u64>().ok()) {
                last = Some(index);
            }
        }
        Ok(last.map_or(1, |index| index + 1))
    }

    /// Write the CSV header when starting a fresh log.
    fn ensure_log_header(&self) -> AppResult<()> {
        if self.ctx.log_path.exists() {
            return Ok(());
        }
        let mut writer = csv::Writer::from_writer(File::create(&self.ctx.log_path)?);
        writer.write_record(LOG_HEADER)?;
        writer.flush()?;
        Ok(())
    }
}

// ---------- run folder selection ----------

/// Create a fresh `Run_<timestamp>` directory, uniquified with a numeric
/// suffix if a restart lands twice within the same second.
fn create_new_run_dir(base_dir: &Path) -> AppResult<PathBuf> {
    let stamp = Local::now().format("%Y%m%d_%H%M%S").to_string();
    for attempt in 0u32.. {
        let name = if attempt == 0 {
            format!("Run_{stamp}")
        } else {
            format!("Run_{stamp}_{}", attempt + 1)
        };
        let candidate = base_dir.join(name);
        match fs::create_dir(&candidate) {
            Ok(()) => {
                info!(run_dir = %candidate.display(), "created run directory");
                return Ok(candidate);
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e.into()),
        }
    }
    unreachable!("suffix loop always returns")
}

/// Most recently modified run directory under `base_dir`, if any.
fn find_latest_run_dir(base_dir: &Path) -> AppResult<Option<PathBuf>> {
    let mut latest: Option<(std::time::SystemTime, PathBuf)> = None;
    for entry in fs::read_dir(base_dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        if !RUN_DIR_RE.is_match(&entry.file_name().to_string_lossy()) {
            continue;
        }
        let modified = entry.metadata()?.modified()?;
        if latest.as_ref().is_none_or(|(t, _)| modified > *t) {
            latest = Some((modified, entry.path()));
        }
    }
    Ok(latest.map(|(_, p)| p))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open(base: &Path, mode: RunMode) -> ExperimentStore {
        ExperimentStore::open(base, mode, "jpg").expect("open store")
    }

    #[test]
    fn test_restart_creates_fresh_run_dir() {
        let base = tempfile::tempdir().expect("tempdir");
        let first = open(base.path(), RunMode::Restart);
        let second = open(base.path(), RunMode::Restart);

        assert_ne!(first.context().run_dir, second.context().run_dir);
        assert!(first.context().photos_dir.is_dir());
        assert!(second.context().photos_dir.is_dir());
        let name = second
            .context()
            .run_dir
            .file_name()
            .unwrap()
            .to_string_lossy()
            .to_string();
        assert!(RUN_DIR_RE.is_match(&name), "unexpected name {name}");
    }

    #[test]
    fn test_trigger_allocation_is_strictly_increasing() {
        let base = tempfile::tempdir().expect("tempdir");
        let mut store = open(base.path(), RunMode::Restart);

        assert_eq!(store.allocate_trigger(true).unwrap(), 1);
        assert_eq!(store.allocate_trigger(false).unwrap(), 2);
        assert_eq!(store.allocate_trigger(true).unwrap(), 3);
        assert_eq!(store.next_trigger_index(), 4);
        // Gate state never affects the image counter.
        assert_eq!(store.next_image_index(), 1);
    }

    #[test]
    fn test_next_image_path_is_stable_until_commit() {
        let base = tempfile::tempdir().expect("tempdir");
        let mut store = open(base.path(), RunMode::Restart);

        let (path_a, idx_a) = store.next_image_path();
        let (path_b, idx_b) = store.next_image_path();
        assert_eq!(path_a, path_b);
        assert_eq!(idx_a, idx_b);
        assert_eq!(idx_a, 1);

        store.commit_capture_success().unwrap();
        let (path_c, idx_c) = store.next_image_path();
        assert_ne!(path_a, path_c);
        assert_eq!(idx_c, 2);
    }

    #[test]
    fn test_resume_reads_persisted_counters() {
        let base = tempfile::tempdir().expect("tempdir");
        {
            let mut store = open(base.path(), RunMode::Restart);
            for _ in 0..11 {
                store.allocate_trigger(true).unwrap();
            }
            for _ in 0..6 {
                store.commit_capture_success().unwrap();
            }
        }

        let store = open(base.path(), RunMode::Resume);
        assert_eq!(store.next_trigger_index(), 12);
        assert_eq!(store.next_image_index(), 7);
    }

    #[test]
    fn test_resume_clamps_counters_to_one() {
        let base = tempfile::tempdir().expect("tempdir");
        let run_dir = {
            let store = open(base.path(), RunMode::Restart);
            store.context().run_dir.clone()
        };
        fs::write(
            run_dir.join("state.json"),
            r#"{"next_image_index":0,"next_trigger_index":0,"run_dir":"x","updated":"2024-01-01T00:00:00Z"}"#,
        )
        .unwrap();

        let store = open(base.path(), RunMode::Resume);
        assert_eq!(store.next_image_index(), 1);
        assert_eq!(store.next_trigger_index(), 1);
    }

    #[test]
    fn test_rebuild_from_photos_and_log() {
        let base = tempfile::tempdir().expect("tempdir");
        let run_dir = base.path().join("Run_20240101_120000");
        let photos = run_dir.join("photos");
        fs::create_dir_all(&photos).unwrap();
        for i in 1..=4 {
            fs::write(photos.join(format!("01012024_{i:05}.jpg")), b"img").unwrap();
        }
        // Stray files must not confuse the scan.
        fs::write(photos.join("notes.txt"), b"x").unwrap();
        fs::write(
            run_dir.join("log.csv"),
            "timestamp,trigger_index,gate_state,captured,filename\n\
             2024-01-01T12:00:00.000,8,1,1,01012024_00004.jpg\n\
             2024-01-01T12:00:01.000,9,0,0,\n",
        )
        .unwrap();

        let store = open(base.path(), RunMode::Resume);
        assert_eq!(store.context().run_dir, run_dir);
        assert_eq!(store.next_image_index(), 5);
        assert_eq!(store.next_trigger_index(), 10);
        // The rebuilt state is persisted immediately.
        assert!(run_dir.join("state.json").exists());
    }

    #[test]
    fn test_corrupt_state_triggers_rebuild() {
        let base = tempfile::tempdir().expect("tempdir");
        let run_dir = {
            let mut store = open(base.path(), RunMode::Restart);
            store.allocate_trigger(true).unwrap();
            store.allocate_trigger(true).unwrap();
            store
                .append_log_row(&LogRow::gated_off(1, Local::now()))
                .unwrap();
            store
                .append_log_row(&LogRow::gated_off(2, Local::now()))
                .unwrap();
            store.context().run_dir.clone()
        };
        fs::write(run_dir.join("state.json"), b"{not json").unwrap();

        let store = open(base.path(), RunMode::Resume);
        assert_eq!(store.next_trigger_index(), 3);
        assert_eq!(store.next_image_index(), 1);
    }

    #[test]
    fn test_log_rows_append_under_single_header() {
        let base = tempfile::tempdir().expect("tempdir");
        let mut store = open(base.path(), RunMode::Restart);

        store
            .append_log_row(&LogRow::captured(1, Local::now(), "01012024_00001.jpg"))
            .unwrap();
        store.append_log_row(&LogRow::gated_off(2, Local::now())).unwrap();
        store
            .append_log_row(&LogRow::failed(3, Local::now(), "Camera busy".into()))
            .unwrap();

        let raw = fs::read_to_string(&store.context().log_path).unwrap();
        let lines: Vec<&str> = raw.lines().collect();
        assert_eq!(lines.len(), 4);
        assert_eq!(
            lines[0],
            "timestamp,trigger_index,gate_state,captured,filename"
        );
        assert!(lines[1].contains(",1,1,1,01012024_00001.jpg"));
        assert!(lines[2].ends_with(",2,0,0,"));
        assert!(lines[3].ends_with(",3,1,0,"));
    }

    #[test]
    fn test_restart_ignores_existing_runs() {
        let base = tempfile::tempdir().expect("tempdir");
        {
            let mut store = open(base.path(), RunMode::Restart);
            for _ in 0..5 {
                store.allocate_trigger(true).unwrap();
            }
        }
        let store = open(base.path(), RunMode::Restart);
        assert_eq!(store.next_trigger_index(), 1);
        assert_eq!(store.next_image_index(), 1);
    }
}
