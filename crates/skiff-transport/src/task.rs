//! Supervised task spawning.
//!
//! Long-running loops run as independent tasks. A panic inside one of them
//! is caught at the task boundary, logged with a backtrace and turned into
//! a [`TaskError`], so a single faulty link never takes the process down.
//!
//! The backtrace has to be taken while the panicking frames still exist, so
//! a process-wide panic hook records it in a thread-local slot and the task
//! boundary picks it up after unwinding.

use std::any::Any;
use std::backtrace::Backtrace;
use std::cell::RefCell;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Once;

use futures_util::FutureExt;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::error;

/// A supervised task did not finish normally.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TaskError {
    /// The task panicked.
    #[error("task {name} panicked: {message}")]
    Panicked {
        /// Task label.
        name: String,
        /// Panic payload, when it was a string.
        message: String,
    },
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

thread_local! {
    static PANIC_BACKTRACE: RefCell<Option<Backtrace>> = const { RefCell::new(None) };
}

static HOOK: Once = Once::new();

/// Chain a hook in front of the current one that records the backtrace of
/// every panic on its thread.
fn install_hook() {
    HOOK.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            let backtrace = Backtrace::force_capture();
            PANIC_BACKTRACE.with(|slot| *slot.borrow_mut() = Some(backtrace));
            previous(info);
        }));
    });
}

/// Backtrace of the last panic on this thread, if not taken yet.
fn take_backtrace() -> Option<Backtrace> {
    PANIC_BACKTRACE.with(|slot| slot.borrow_mut().take())
}

/// Run `future`, converting a panic into [`TaskError::Panicked`].
///
/// # Errors
///
/// Returns [`TaskError::Panicked`] if the future panicked.
pub async fn supervised<F>(name: &str, future: F) -> Result<F::Output, TaskError>
where
    F: Future,
{
    install_hook();
    AssertUnwindSafe(future).catch_unwind().await.map_err(|payload| {
        let message = panic_message(payload.as_ref());
        match take_backtrace() {
            Some(backtrace) => error!(task = name, panic = %message, backtrace = %backtrace, "Task panicked"),
            None => error!(task = name, panic = %message, "Task panicked"),
        }
        TaskError::Panicked {
            name: name.to_string(),
            message,
        }
    })
}

/// Spawn `future` on the runtime under [`supervised`].
pub fn spawn_supervised<F>(name: impl Into<String>, future: F) -> JoinHandle<Result<F::Output, TaskError>>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    let name = name.into();
    tokio::spawn(async move { supervised(&name, future).await })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_normal_completion() {
        let result = spawn_supervised("ok", async { 7 }).await.unwrap();
        assert_eq!(result, Ok(7));
    }

    #[tokio::test]
    async fn test_panic_becomes_error() {
        let result = spawn_supervised("boom", async {
            if true {
                panic!("service id out of range");
            }
        })
        .await
        .unwrap();

        assert_eq!(
            result,
            Err(TaskError::Panicked {
                name: "boom".to_string(),
                message: "service id out of range".to_string(),
            })
        );
    }

    #[inline(never)]
    fn explode_in_parser() {
        panic!("parser blew up");
    }

    #[tokio::test]
    async fn test_backtrace_taken_at_panic_site() {
        install_hook();
        take_backtrace();

        let caught = AssertUnwindSafe(async { explode_in_parser() }).catch_unwind().await;
        assert!(caught.is_err());

        let backtrace = take_backtrace().unwrap();
        assert_eq!(backtrace.status(), std::backtrace::BacktraceStatus::Captured);
        assert!(backtrace.to_string().contains("explode_in_parser"));
        assert!(take_backtrace().is_none());
    }

    #[tokio::test]
    async fn test_formatted_panic_message() {
        let id = 42;
        let result = supervised("fmt", async move { panic!("bad id {id}") }).await;
        let Err(TaskError::Panicked { message, .. }) = result else {
            panic!("expected panic");
        };
        assert_eq!(message, "bad id 42");
    }
}
