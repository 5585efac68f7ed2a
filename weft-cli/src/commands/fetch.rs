//! `weft fetch` — stream an object to stdout through the range reader.
//!
//! Network reads run in a fiber on a reactor; stdout writes are offloaded to
//! a worker thread so the reactor never blocks on a slow pipe.

use std::sync::{Arc, Mutex};

use tracing::info;

use weft::fibers::Done;
use weft::object_store::{object_url, split_object_path, AccessTokenProvider, StaticTokenProvider};
use weft::{FiberQueuePool, NiceLevel, RangeReader, ReactorPool, ReactorPoolConfig, Status};

use crate::error::CliError;

pub fn run(path: String, base_url: String, token: String) -> Result<(), CliError> {
    let (bucket, object) = split_object_path(&path)
        .ok_or_else(|| CliError::Config(format!("not a gs:// object path: {path}")))?;
    if object.is_empty() {
        return Err(CliError::Config(format!("missing object name in {path}")));
    }
    let url = object_url(&base_url, bucket, object);

    let pool = ReactorPool::start(ReactorPoolConfig::with_reactors(1))?;
    let offload = Arc::new(FiberQueuePool::new(1));
    let provider: Arc<dyn AccessTokenProvider> = Arc::new(StaticTokenProvider::new(token));

    let done = Done::new();
    let outcome: Arc<Mutex<Option<Result<u64, Status>>>> = Arc::new(Mutex::new(None));
    {
        let done = done.clone();
        let outcome = Arc::clone(&outcome);
        let offload = Arc::clone(&offload);
        pool.handle(0).spawn_fn(NiceLevel::NORMAL, move || async move {
            let result = fetch_object(url, provider, offload).await;
            *outcome.lock().expect("outcome slot poisoned") = Some(result);
            done.notify();
        });
    }
    done.wait_blocking();
    pool.stop();
    offload.shutdown();

    let total = outcome
        .lock()
        .expect("outcome slot poisoned")
        .take()
        .expect("fetch fiber completed")?;
    info!(bytes = total, "fetch complete");
    Ok(())
}

async fn fetch_object(
    url: String,
    provider: Arc<dyn AccessTokenProvider>,
    offload: Arc<FiberQueuePool>,
) -> Result<u64, Status> {
    let mut reader = RangeReader::open(reqwest::Client::new(), provider, url).await?;
    let mut buf = vec![0u8; 64 * 1024];
    let mut total = 0u64;
    loop {
        let offset = reader.offset();
        let n = reader.read(offset, &mut buf).await?;
        if n == 0 {
            break;
        }
        total += n as u64;
        let chunk = buf[..n].to_vec();
        offload
            .submit(move || {
                use std::io::Write;
                let mut stdout = std::io::stdout().lock();
                stdout.write_all(&chunk)
            })
            .await
            .map_err(Status::from)?;
    }
    reader.close();
    Ok(total)
}
