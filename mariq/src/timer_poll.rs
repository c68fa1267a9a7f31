//! Composite wait primitive: fd readiness or a one-shot deadline,
//! whichever comes first.
use std::{
    os::fd::RawFd,
    pin::Pin,
    task::{Context, Poll, Waker},
    time::Duration,
};
use tokio::{
    io::{Interest, Ready, unix::AsyncFd},
    time::{Instant, Sleep, sleep},
};

use crate::{
    Result,
    error::BadArg,
};

/// Waits on a file descriptor for requested readiness, bounded by a
/// one-shot deadline.
///
/// Exactly one of [`PollOutcome::Ready`] or [`PollOutcome::TimedOut`] is
/// produced per [`start`][TimerPoll::start]. The watched descriptor is
/// borrowed, never closed; [`change_fd`][TimerPoll::change_fd] rebinds the
/// watcher while stopped.
///
/// Must be created and awaited inside a tokio runtime.
pub struct TimerPoll {
    fd: Option<AsyncFd<RawFd>>,
    deadline: Pin<Box<Sleep>>,
    interest: Option<Interest>,
}

/// What resolved a [`TimerPoll::wait`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// The descriptor became ready for one of the requested interests.
    Ready(Ready),
    /// The deadline elapsed first.
    TimedOut,
}

impl TimerPoll {
    /// Register `fd` with the current runtime.
    ///
    /// The descriptor must already be in non-blocking mode.
    pub fn new(fd: RawFd) -> Result<Self> {
        Ok(Self {
            fd: Some(AsyncFd::new(fd)?),
            deadline: Box::pin(sleep(Duration::ZERO)),
            interest: None,
        })
    }

    /// Arm both halves: readiness on `interest`, deadline at `timeout`
    /// from now.
    ///
    /// The caller arms only after its I/O attempt reported would-block, so
    /// readiness cached before that attempt is cleared here; events landing
    /// after the attempt survive the clear and resolve the next
    /// [`wait`][TimerPoll::wait] immediately. Callers cover the remaining
    /// window by retrying the I/O once between `start` and `wait`.
    pub fn start(&mut self, timeout: Duration, interest: Interest) -> Result<()> {
        if timeout.is_zero() {
            return Err(BadArg.into());
        }
        let Some(fd) = self.fd.as_ref() else {
            return Err(BadArg.into());
        };

        let mut cx = Context::from_waker(Waker::noop());
        if interest.is_readable() {
            if let Poll::Ready(Ok(mut guard)) = fd.poll_read_ready(&mut cx) {
                guard.clear_ready_matching(Ready::READABLE);
            }
        }
        if interest.is_writable() {
            if let Poll::Ready(Ok(mut guard)) = fd.poll_write_ready(&mut cx) {
                guard.clear_ready_matching(Ready::WRITABLE);
            }
        }

        self.deadline.as_mut().reset(Instant::now() + timeout);
        self.interest = Some(interest);
        Ok(())
    }

    /// Disarm both halves without tearing down.
    pub fn stop(&mut self) {
        self.interest = None;
    }

    /// Rebind the watcher to `new_fd` without resetting the deadline half.
    ///
    /// Legal only while stopped and not closed.
    pub fn change_fd(&mut self, new_fd: RawFd) -> Result<()> {
        if self.interest.is_some() || self.fd.is_none() {
            return Err(BadArg.into());
        }
        self.fd = Some(AsyncFd::new(new_fd)?);
        Ok(())
    }

    /// Deregister the descriptor and refuse further starts. Idempotent.
    pub fn deinit(&mut self) {
        self.interest = None;
        self.fd = None;
    }

    pub fn is_closed(&self) -> bool {
        self.fd.is_none()
    }

    /// Wait for the first of readiness or deadline. Disarms on resolve.
    pub async fn wait(&mut self) -> Result<PollOutcome> {
        std::future::poll_fn(|cx| self.poll_wait(cx)).await
    }

    fn poll_wait(&mut self, cx: &mut Context<'_>) -> Poll<Result<PollOutcome>> {
        let Some(interest) = self.interest else {
            return Poll::Ready(Err(BadArg.into()));
        };
        let Some(fd) = self.fd.as_ref() else {
            return Poll::Ready(Err(BadArg.into()));
        };

        if interest.is_readable() {
            match fd.poll_read_ready(cx) {
                Poll::Ready(Ok(guard)) => {
                    let ready = guard.ready();
                    drop(guard);
                    self.interest = None;
                    return Poll::Ready(Ok(PollOutcome::Ready(ready)));
                }
                Poll::Ready(Err(err)) => {
                    self.interest = None;
                    return Poll::Ready(Err(err.into()));
                }
                Poll::Pending => {}
            }
        }
        if interest.is_writable() {
            match fd.poll_write_ready(cx) {
                Poll::Ready(Ok(guard)) => {
                    let ready = guard.ready();
                    drop(guard);
                    self.interest = None;
                    return Poll::Ready(Ok(PollOutcome::Ready(ready)));
                }
                Poll::Ready(Err(err)) => {
                    self.interest = None;
                    return Poll::Ready(Err(err.into()));
                }
                Poll::Pending => {}
            }
        }

        if self.deadline.as_mut().poll(cx).is_ready() {
            self.interest = None;
            return Poll::Ready(Ok(PollOutcome::TimedOut));
        }

        Poll::Pending
    }
}

impl std::fmt::Debug for TimerPoll {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerPoll")
            .field("closed", &self.fd.is_none())
            .field("armed", &self.interest.is_some())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use std::io::Write;
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;

    use super::*;

    fn pair() -> (UnixStream, UnixStream) {
        let (a, b) = UnixStream::pair().unwrap();
        a.set_nonblocking(true).unwrap();
        b.set_nonblocking(true).unwrap();
        (a, b)
    }

    #[tokio::test]
    async fn resolves_on_timeout_when_fd_stays_quiet() {
        let (a, _b) = pair();
        let mut tp = TimerPoll::new(a.as_raw_fd()).unwrap();
        tp.start(Duration::from_millis(20), Interest::READABLE).unwrap();
        assert_eq!(tp.wait().await.unwrap(), PollOutcome::TimedOut);
    }

    #[tokio::test]
    async fn resolves_on_readiness_before_timeout() {
        let (a, mut b) = pair();
        let mut tp = TimerPoll::new(a.as_raw_fd()).unwrap();
        tp.start(Duration::from_secs(5), Interest::READABLE).unwrap();

        b.write_all(b"x").unwrap();

        match tp.wait().await.unwrap() {
            PollOutcome::Ready(ready) => assert!(ready.is_readable()),
            PollOutcome::TimedOut => panic!("deadline won a ready fd"),
        }
    }

    #[tokio::test]
    async fn exactly_one_outcome_per_start() {
        let (a, mut b) = pair();
        let mut tp = TimerPoll::new(a.as_raw_fd()).unwrap();
        tp.start(Duration::from_secs(5), Interest::READABLE).unwrap();
        b.write_all(b"x").unwrap();

        tp.wait().await.unwrap();
        // disarmed after resolving, wait again is a usage error
        assert!(tp.wait().await.is_err());
    }

    #[tokio::test]
    async fn rejects_zero_timeout() {
        let (a, _b) = pair();
        let mut tp = TimerPoll::new(a.as_raw_fd()).unwrap();
        assert!(tp.start(Duration::ZERO, Interest::READABLE).is_err());
    }

    #[tokio::test]
    async fn change_fd_only_while_stopped() {
        let (a, _b) = pair();
        let (c, _d) = pair();
        let mut tp = TimerPoll::new(a.as_raw_fd()).unwrap();

        tp.start(Duration::from_secs(5), Interest::READABLE).unwrap();
        assert!(tp.change_fd(c.as_raw_fd()).is_err());

        tp.stop();
        tp.change_fd(c.as_raw_fd()).unwrap();
    }

    #[tokio::test]
    async fn deinit_is_idempotent_and_final() {
        let (a, _b) = pair();
        let mut tp = TimerPoll::new(a.as_raw_fd()).unwrap();
        tp.deinit();
        tp.deinit();
        assert!(tp.is_closed());
        assert!(tp.start(Duration::from_secs(1), Interest::READABLE).is_err());
        assert!(tp.change_fd(a.as_raw_fd()).is_err());
    }
}
