//! Client lifeline file descriptors.
//!
//! Every externally requested resource (connected namespace, DNS
//! redirection rule, port forward) is bound to a file descriptor held by
//! the requesting client. The fd becoming readable means the peer closed
//! it, which is the authoritative signal that the associated state must
//! be released; client crashes therefore auto-release their state.

use std::os::fd::OwnedFd;

use thiserror::Error;
use tokio::io::Interest;
use tokio::io::unix::AsyncFd;

#[derive(Debug, Error)]
pub enum LifelineError {
    #[error("failed to register lifeline fd: {0}")]
    Register(#[from] std::io::Error),
}

/// Cancels the watch on drop without invoking the registered closure.
pub struct CancelHandle {
    handle: tokio::task::JoinHandle<()>,
}

impl Drop for CancelHandle {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Watches client lifeline fds on the current-thread executor.
#[derive(Default)]
pub struct LifelineFdService;

impl LifelineFdService {
    pub fn new() -> LifelineFdService {
        LifelineFdService
    }

    /// Registers read-readiness on `fd`; when the peer closes it,
    /// `on_close` runs exactly once on the executor. Dropping the
    /// returned handle removes the registration without firing.
    ///
    /// Must be called from within a `tokio::task::LocalSet`.
    pub fn add_lifeline_fd(
        &self,
        fd: OwnedFd,
        on_close: impl FnOnce() + 'static,
    ) -> Result<CancelHandle, LifelineError> {
        let async_fd = AsyncFd::with_interest(fd, Interest::READABLE)?;
        let handle = tokio::task::spawn_local(async move {
            match async_fd.readable().await {
                Ok(_) => on_close(),
                Err(error) => {
                    tracing::warn!(%error, "lifeline fd readiness watch failed");
                    on_close();
                }
            }
        });
        Ok(CancelHandle { handle })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::os::unix::net::UnixStream;
    use std::rc::Rc;
    use std::time::Duration;

    fn lifeline_pair() -> (OwnedFd, UnixStream) {
        let (ours, theirs) = UnixStream::pair().unwrap();
        ours.set_nonblocking(true).unwrap();
        (OwnedFd::from(ours), theirs)
    }

    #[tokio::test]
    async fn closure_fires_once_when_peer_closes() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let service = LifelineFdService::new();
                let (fd, peer) = lifeline_pair();
                let fired = Rc::new(Cell::new(0u32));
                let fired_clone = Rc::clone(&fired);
                let _handle = service
                    .add_lifeline_fd(fd, move || fired_clone.set(fired_clone.get() + 1))
                    .unwrap();

                tokio::time::sleep(Duration::from_millis(10)).await;
                assert_eq!(fired.get(), 0);

                drop(peer);
                tokio::time::sleep(Duration::from_millis(50)).await;
                assert_eq!(fired.get(), 1);
            })
            .await;
    }

    #[tokio::test]
    async fn dropping_handle_cancels_without_firing() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let service = LifelineFdService::new();
                let (fd, peer) = lifeline_pair();
                let fired = Rc::new(Cell::new(0u32));
                let fired_clone = Rc::clone(&fired);
                let handle = service
                    .add_lifeline_fd(fd, move || fired_clone.set(fired_clone.get() + 1))
                    .unwrap();

                drop(handle);
                drop(peer);
                tokio::time::sleep(Duration::from_millis(50)).await;
                assert_eq!(fired.get(), 0);
            })
            .await;
    }
}
