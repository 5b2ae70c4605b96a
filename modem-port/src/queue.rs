use std::collections::VecDeque;

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::error::Error;
use core::time::Duration;

pub(crate) type ReplySender = oneshot::Sender<Result<Vec<u8>, Error>>;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum TxState {
    Queued,
    Sending,
    AwaitingResponse,
}

/// A command waiting for, or going through, its exchange with the device.
#[derive(Debug)]
pub(crate) struct Transaction {
    pub command: Vec<u8>,
    pub timeout: Duration,
    pub allow_cached: bool,
    pub cancel: Option<CancellationToken>,
    pub state: TxState,
    /// Number of command bytes already written.
    pub written: usize,
    /// Would-block writes still tolerated.
    pub retries_left: u32,
    reply: ReplySender,
}

impl Transaction {
    pub fn new(
        command: Vec<u8>,
        timeout: Duration,
        allow_cached: bool,
        cancel: Option<CancellationToken>,
        reply: ReplySender,
    ) -> Self {
        Self {
            command,
            timeout,
            allow_cached,
            cancel,
            state: TxState::Queued,
            written: 0,
            retries_left: 0,
            reply,
        }
    }

    pub fn remaining(&self) -> &[u8] {
        &self.command[self.written..]
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(CancellationToken::is_cancelled)
    }

    /// Hand the result to the submitter. A submitter that stopped waiting is
    /// not an error.
    pub fn complete(self, result: Result<Vec<u8>, Error>) {
        let _ = self.reply.send(result);
    }
}

/// Pending transactions, oldest first. Only the head is ever written to or
/// awaited on.
#[derive(Debug, Default)]
pub(crate) struct CommandQueue {
    inner: VecDeque<Transaction>,
}

impl CommandQueue {
    /// Queue a transaction. With `run_next` it goes in front of everything
    /// that has not started yet, but never in front of the in-flight head.
    pub fn push(&mut self, tx: Transaction, run_next: bool) {
        if !run_next {
            self.inner.push_back(tx);
            return;
        }
        let index = match self.inner.front() {
            Some(head) if head.state != TxState::Queued => 1,
            _ => 0,
        };
        self.inner.insert(index, tx);
    }

    pub fn head(&self) -> Option<&Transaction> {
        self.inner.front()
    }

    pub fn head_mut(&mut self) -> Option<&mut Transaction> {
        self.inner.front_mut()
    }

    pub fn pop(&mut self) -> Option<Transaction> {
        self.inner.pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Complete every pending transaction with the error `err()` builds.
    pub fn fail_all(&mut self, err: impl Fn() -> Error) {
        for tx in self.inner.drain(..) {
            tx.complete(Err(err()));
        }
    }
}
