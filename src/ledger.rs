// =============================================================================
// Append-only CSV ledger
// =============================================================================
//
// Two ledgers exist: the price ledger (price + indicators) and the prediction
// ledger.  Both are plain UTF-8 CSV, one record per line, never truncated or
// rewritten.
//
// Each append renders the whole line first, then writes it with a single
// `write_all` to a file opened in append mode while holding a per-path lock.
// Concurrent callers (the scheduler and the HTTP logging endpoints) therefore
// never interleave partial rows.
// =============================================================================

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::error::LedgerError;
use crate::types::{LedgerRecord, PredictionRecord};

/// Append-only writer over the price and prediction ledger files.
pub struct Ledger {
    price_path: PathBuf,
    prediction_path: PathBuf,
    write_headers: bool,
    locks: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl Ledger {
    pub fn new(
        price_path: impl Into<PathBuf>,
        prediction_path: impl Into<PathBuf>,
        write_headers: bool,
    ) -> Self {
        Self {
            price_path: price_path.into(),
            prediction_path: prediction_path.into(),
            write_headers,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn price_path(&self) -> &Path {
        &self.price_path
    }

    pub fn prediction_path(&self) -> &Path {
        &self.prediction_path
    }

    /// Append one price/indicator row to the price ledger.
    pub fn append_price(&self, record: &LedgerRecord) -> Result<(), LedgerError> {
        let header = self.write_headers.then_some(LedgerRecord::HEADER);
        self.append(&self.price_path, &record.to_csv_line(), header)
    }

    /// Append one prediction row to the prediction ledger.
    pub fn append_prediction(&self, record: &PredictionRecord) -> Result<(), LedgerError> {
        let header = self.write_headers.then_some(PredictionRecord::HEADER);
        self.append(&self.prediction_path, &record.to_csv_line(), header)
    }

    /// Append exactly one newline-terminated row to `path`.
    ///
    /// The containing directory is created when missing.  `header` is
    /// written first when the file is empty.  `row` must not contain a
    /// newline.
    pub fn append(&self, path: &Path, row: &str, header: Option<&str>) -> Result<(), LedgerError> {
        let lock = self.lock_for(path);
        let _guard = lock.lock();

        let io_err = |source: std::io::Error| LedgerError::Io {
            path: path.to_path_buf(),
            source,
        };

        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            if !dir.exists() {
                info!(dir = %dir.display(), "creating ledger directory");
            }
            // Succeeds when another process created it first.
            std::fs::create_dir_all(dir).map_err(io_err)?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(io_err)?;

        let mut buf = String::with_capacity(row.len() + 64);
        if let Some(header) = header {
            let empty = file.metadata().map_err(io_err)?.len() == 0;
            if empty {
                buf.push_str(header);
                buf.push('\n');
            }
        }
        buf.push_str(row);
        buf.push('\n');

        file.write_all(buf.as_bytes()).map_err(io_err)?;
        file.flush().map_err(io_err)?;

        debug!(path = %path.display(), row, "ledger row appended");
        Ok(())
    }

    fn lock_for(&self, path: &Path) -> Arc<Mutex<()>> {
        self.locks
            .lock()
            .entry(path.to_path_buf())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}
