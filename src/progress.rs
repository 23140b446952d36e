use std::{
    any::Any,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::Arc,
};
use tracing::error;

use crate::error::FailureReason;
use crate::fetch::FetchOutcome;
use crate::publish::UploadOutcome;

/// Something worth showing a user while a phase runs.
#[derive(Debug)]
pub enum ProgressEvent<'a> {
    /// The number of items the phase is about to process.
    Started { total: u64 },
    Fetched(&'a FetchOutcome),
    Published(&'a UploadOutcome),
}

/// Callback invoked once per event, from the single coordinating task.
pub type ProgressHook = Arc<dyn Fn(&ProgressEvent<'_>) + Send + Sync>;

/// Invokes `hook`, turning a panic into an `Internal` failure.
pub(crate) fn notify(
    hook: Option<&ProgressHook>,
    event: &ProgressEvent<'_>,
) -> Result<(), FailureReason> {
    let Some(hook) = hook else {
        return Ok(());
    };

    catch_unwind(AssertUnwindSafe(|| hook(event))).map_err(|panic| {
        let message = format!("progress hook panicked: {}", panic_message(&*panic));
        error!("{}", message);
        FailureReason::internal(message)
    })
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s
    } else {
        "unknown panic"
    }
}
