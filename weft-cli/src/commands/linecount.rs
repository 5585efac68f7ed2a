//! `weft linecount` — count lines across files with the full runtime stack.
//!
//! The shape of a pipeline driver: file names flow through a bounded channel
//! to one consumer fiber per reactor; each file is read by the offload pool
//! (disk I/O never blocks a reactor); counts merge under a fiber mutex.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{info, warn};

use weft::fibers::Mutex as FiberMutex;
use weft::{Channel, FiberQueuePool, ReactorPool, ReactorPoolConfig};

use crate::error::CliError;

/// Capacity of the file-name channel; producers feel backpressure beyond it.
const FILE_NAME_QUEUE_CAPACITY: usize = 16;

pub fn run(
    files: Vec<PathBuf>,
    reactors: Option<usize>,
    workers: usize,
) -> Result<(), CliError> {
    if files.is_empty() {
        return Err(CliError::Config("no input files given".to_string()));
    }

    let pool_config = reactors
        .map(ReactorPoolConfig::with_reactors)
        .unwrap_or_default();
    let pool = ReactorPool::start(pool_config)?;
    let offload = Arc::new(FiberQueuePool::new(workers));
    let names = Channel::<PathBuf>::bounded(FILE_NAME_QUEUE_CAPACITY);
    let total = Arc::new(FiberMutex::new(0u64));

    // Producer: feed file names from this thread, then close the channel so
    // the consumer fibers drain and finish.
    let producer = {
        let names = names.clone();
        std::thread::spawn(move || {
            for file in files {
                if names.send_blocking(file).is_err() {
                    break;
                }
            }
            names.close();
        })
    };

    // One consumer fiber per reactor; returns once all of them drained.
    {
        let names = names.clone();
        let offload = Arc::clone(&offload);
        let total = Arc::clone(&total);
        pool.await_on_all(move |_ctx| {
            let names = names.clone();
            let offload = Arc::clone(&offload);
            let total = Arc::clone(&total);
            async move {
                while let Ok(path) = names.recv().await {
                    let path_display = path.display().to_string();
                    match offload.submit(move || count_lines(&path)).await {
                        Ok(count) => {
                            *total.lock().await += count;
                        }
                        Err(err) => warn!(file = %path_display, error = %err, "skipping file"),
                    }
                }
            }
        });
    }
    producer.join().expect("producer thread");

    let total = *total.try_lock().expect("all consumer fibers finished");
    info!(lines = total, "line count complete");
    println!("{total}");

    offload.shutdown();
    pool.stop();
    Ok(())
}

fn count_lines(path: &Path) -> std::io::Result<u64> {
    let data = std::fs::read(path)?;
    Ok(data.iter().filter(|&&b| b == b'\n').count() as u64)
}
