use std::future::Future;
use std::time::Duration;

use crate::util::MaybeSend;

/// Spawns a background task on the ambient executor.
#[cfg(target_arch = "wasm32")]
pub fn spawn_detached<F>(future: F)
where
    F: Future<Output = ()> + MaybeSend + 'static,
{
    wasm_bindgen_futures::spawn_local(future);
}

/// Spawns a background task on the ambient tokio runtime, or on a shared
/// fallback runtime driven by its own thread when called outside one.
#[cfg(not(target_arch = "wasm32"))]
pub fn spawn_detached<F>(future: F)
where
    F: Future<Output = ()> + MaybeSend + 'static,
{
    use std::sync::LazyLock;
    use tokio::runtime::{Builder, Handle};

    static FALLBACK: LazyLock<Option<Handle>> = LazyLock::new(|| {
        let runtime = match Builder::new_current_thread().enable_all().build() {
            Ok(runtime) => runtime,
            Err(err) => {
                log::error!("failed to build fallback tokio runtime: {err}");
                return None;
            }
        };
        let handle = runtime.handle().clone();
        std::thread::Builder::new()
            .name("firestore-sync-runtime".into())
            .spawn(move || runtime.block_on(futures::future::pending::<()>()))
            .ok()?;
        Some(handle)
    });

    if let Ok(handle) = Handle::try_current() {
        handle.spawn(future);
    } else if let Some(handle) = FALLBACK.as_ref() {
        handle.spawn(future);
    } else {
        log::warn!("dropping background task: no runtime available");
    }
}

/// Waits for `duration`; zero durations complete immediately.
pub async fn sleep(duration: Duration) {
    if duration.is_zero() {
        return;
    }
    sleep_impl(duration).await;
}

#[cfg(target_arch = "wasm32")]
async fn sleep_impl(duration: Duration) {
    gloo_timers::future::sleep(duration).await;
}

#[cfg(not(target_arch = "wasm32"))]
async fn sleep_impl(duration: Duration) {
    tokio::time::sleep(duration).await;
}

/// Wall-clock milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn spawned_task_runs() {
        let flag = Arc::new(AtomicBool::new(false));
        let task_flag = Arc::clone(&flag);
        spawn_detached(async move {
            task_flag.store(true, Ordering::SeqCst);
        });
        for _ in 0..20 {
            if flag.load(Ordering::SeqCst) {
                break;
            }
            sleep(Duration::from_millis(5)).await;
        }
        assert!(flag.load(Ordering::SeqCst));
    }

    #[test]
    fn now_is_after_2020() {
        assert!(now_millis() > 1_577_836_800_000);
    }
}
