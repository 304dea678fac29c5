//! Batch streams over a paging function
//!
//! A producer thread walks the cursor chain and pushes pages into a bounded
//! channel. Failures land in a separate error slot that the consumer reads once
//! the data channel closes, so a failed scan never looks like a finished one.

use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::{Result, StorageError};

/// Batches in flight between producer and consumer
const STREAM_BUFFER: usize = 1;

/// Lazy sequence of batches produced by a background scan
///
/// Yields `Ok(batch)` until the scan ends. If the scan failed, the last item
/// is the error. Dropping the stream stops the producer before its next
/// backend request.
pub struct BatchStream<T> {
    batches: Receiver<Vec<T>>,
    error: Arc<Mutex<Option<StorageError>>>,
    finished: bool,
}

impl<T: Send + 'static> BatchStream<T> {
    /// Start a producer that calls `fetch(cursor, batch_size)` until the
    /// returned cursor is empty
    pub fn spawn<F>(name: &str, batch_size: usize, mut fetch: F) -> Result<Self>
    where
        F: FnMut(&str, usize) -> Result<(String, Vec<T>)> + Send + 'static,
    {
        if batch_size == 0 {
            return Err(StorageError::invalid("batch size must be positive"));
        }

        let (tx, rx) = mpsc::sync_channel::<Vec<T>>(STREAM_BUFFER);
        let error = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&error);
        let label = name.to_string();

        thread::Builder::new()
            .name(format!("{label}-stream"))
            .spawn(move || {
                let mut cursor = String::new();
                loop {
                    match fetch(&cursor, batch_size) {
                        Ok((next, batch)) => {
                            debug!(stream = %label, size = batch.len(), "fetched batch");
                            if !batch.is_empty() && tx.send(batch).is_err() {
                                debug!(stream = %label, "consumer gone, stopping producer");
                                return;
                            }
                            if next.is_empty() {
                                return;
                            }
                            cursor = next;
                        }
                        Err(e) => {
                            warn!(stream = %label, error = %e, "stream producer failed");
                            *slot.lock() = Some(e);
                            drop(tx);
                            return;
                        }
                    }
                }
            })
            .map_err(|e| StorageError::BackendUnavailable(format!("failed to spawn stream: {e}")))?;

        Ok(Self {
            batches: rx,
            error,
            finished: false,
        })
    }
}

impl<T> BatchStream<T> {
    /// Drain the stream into one vector, failing if the scan failed
    pub fn collect_all(self) -> Result<Vec<T>> {
        let mut all = Vec::new();
        for batch in self {
            all.extend(batch?);
        }
        Ok(all)
    }
}

impl<T> Iterator for BatchStream<T> {
    type Item = Result<Vec<T>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        match self.batches.recv() {
            Ok(batch) => Some(Ok(batch)),
            Err(_) => {
                self.finished = true;
                self.error.lock().take().map(Err)
            }
        }
    }
}
