//! Completion tracking: tokens for enqueued work and host-signaled events

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use super::QueueId;
use crate::error::EnqueueError;
use crate::memory::{Allocation, SubmissionId};

/// Observable state of a completion token
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenStatus {
    /// Held back by an unresolved dependency; nothing submitted yet
    Deferred,
    Submitted,
    Complete,
    Failed,
}

#[derive(Debug)]
enum TokenState {
    Deferred,
    Submitted {
        submission: SubmissionId,
        tag: u64,
        tag_buffer: Arc<Allocation>,
    },
    Complete,
    Failed,
}

/// Handle on one enqueued operation
///
/// Completion is observed by polling the owning queue's tag buffer; a token
/// never needs the queue to be alive.
#[derive(Debug, Clone)]
pub struct CompletionToken {
    queue: QueueId,
    state: Arc<Mutex<TokenState>>,
}

impl CompletionToken {
    pub(crate) fn deferred(queue: QueueId) -> Self {
        Self {
            queue,
            state: Arc::new(Mutex::new(TokenState::Deferred)),
        }
    }

    pub(crate) fn set_submitted(&self, submission: SubmissionId, tag: u64, tag_buffer: Arc<Allocation>) {
        *self.state.lock().unwrap() = TokenState::Submitted {
            submission,
            tag,
            tag_buffer,
        };
    }

    pub(crate) fn set_failed(&self) {
        *self.state.lock().unwrap() = TokenState::Failed;
    }

    pub fn queue(&self) -> QueueId {
        self.queue
    }

    pub fn status(&self) -> TokenStatus {
        let mut state = self.state.lock().unwrap();
        if let TokenState::Submitted { tag, tag_buffer, .. } = &*state {
            match tag_buffer.read_u64(0) {
                Ok(observed) if observed >= *tag => *state = TokenState::Complete,
                Ok(_) => return TokenStatus::Submitted,
                Err(err) => {
                    log::warn!("reading tag buffer: {err}");
                    return TokenStatus::Submitted;
                }
            }
        }
        match &*state {
            TokenState::Deferred => TokenStatus::Deferred,
            TokenState::Submitted { .. } => TokenStatus::Submitted,
            TokenState::Complete => TokenStatus::Complete,
            TokenState::Failed => TokenStatus::Failed,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.status() == TokenStatus::Complete
    }

    pub fn is_failed(&self) -> bool {
        self.status() == TokenStatus::Failed
    }

    /// Submission and tag once submitted and not yet complete
    pub fn submission(&self) -> Option<(SubmissionId, u64)> {
        match &*self.state.lock().unwrap() {
            TokenState::Submitted { submission, tag, .. } => Some((*submission, *tag)),
            _ => None,
        }
    }

    /// Tag buffer address and tag to wait for from another queue
    pub(crate) fn wait_target(&self) -> Option<(Arc<Allocation>, u64)> {
        match &*self.state.lock().unwrap() {
            TokenState::Submitted { tag, tag_buffer, .. } => Some((Arc::clone(tag_buffer), *tag)),
            _ => None,
        }
    }

    /// Poll until complete, failed, or `timeout` elapses
    pub fn wait(&self, timeout: Duration) -> Result<(), EnqueueError> {
        let start = Instant::now();
        loop {
            match self.status() {
                TokenStatus::Complete => return Ok(()),
                TokenStatus::Failed => return Err(EnqueueError::DependencyFailed),
                _ if start.elapsed() >= timeout => return Err(EnqueueError::Timeout(timeout)),
                _ => std::thread::sleep(Duration::from_micros(50)),
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UserState {
    Unsignaled,
    Complete,
    Failed,
}

/// Event completed by the host
#[derive(Debug, Clone)]
pub struct UserEvent {
    state: Arc<Mutex<UserState>>,
}

impl Default for UserEvent {
    fn default() -> Self {
        Self::new()
    }
}

impl UserEvent {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(UserState::Unsignaled)),
        }
    }

    pub fn set_complete(&self) {
        *self.state.lock().unwrap() = UserState::Complete;
    }

    pub fn set_failed(&self) {
        *self.state.lock().unwrap() = UserState::Failed;
    }

    pub fn is_signaled(&self) -> bool {
        *self.state.lock().unwrap() != UserState::Unsignaled
    }

    fn state(&self) -> UserState {
        *self.state.lock().unwrap()
    }
}

/// Something enqueued work may wait on
#[derive(Debug, Clone)]
pub enum Dependency {
    Token(CompletionToken),
    User(UserEvent),
}

impl From<CompletionToken> for Dependency {
    fn from(token: CompletionToken) -> Self {
        Dependency::Token(token)
    }
}

impl From<&CompletionToken> for Dependency {
    fn from(token: &CompletionToken) -> Self {
        Dependency::Token(token.clone())
    }
}

impl From<UserEvent> for Dependency {
    fn from(event: UserEvent) -> Self {
        Dependency::User(event)
    }
}

impl From<&UserEvent> for Dependency {
    fn from(event: &UserEvent) -> Self {
        Dependency::User(event.clone())
    }
}

/// How a dependency affects work enqueued on `queue`
#[derive(Debug)]
pub(crate) enum Resolution {
    /// Nothing to wait for
    Satisfied,
    /// Emit a semaphore wait on another queue's tag buffer
    Wait { tag_buffer: Arc<Allocation>, tag: u64 },
    /// Work must stay deferred
    Blocked,
    Failed,
}

impl Dependency {
    pub(crate) fn resolve(&self, queue: QueueId) -> Resolution {
        match self {
            Dependency::User(event) => match event.state() {
                UserState::Unsignaled => Resolution::Blocked,
                UserState::Complete => Resolution::Satisfied,
                UserState::Failed => Resolution::Failed,
            },
            Dependency::Token(token) => match token.status() {
                TokenStatus::Complete => Resolution::Satisfied,
                TokenStatus::Failed => Resolution::Failed,
                TokenStatus::Deferred => Resolution::Blocked,
                // same-queue order is implicit
                TokenStatus::Submitted if token.queue() == queue => Resolution::Satisfied,
                TokenStatus::Submitted => match token.wait_target() {
                    Some((tag_buffer, tag)) => Resolution::Wait { tag_buffer, tag },
                    // completed between the two reads
                    None => Resolution::Satisfied,
                },
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{AllocationKind, AllocationRegistry};

    #[test]
    fn test_token_completes_from_tag_buffer() {
        let registry = AllocationRegistry::with_address_space(0x10_0000, 0x10_0000);
        let tag_buffer = registry.allocate(64, 64, AllocationKind::TagBuffer).unwrap();
        let token = CompletionToken::deferred(QueueId(1));
        assert_eq!(token.status(), TokenStatus::Deferred);

        token.set_submitted(SubmissionId::next(), 2, Arc::clone(&tag_buffer));
        assert_eq!(token.status(), TokenStatus::Submitted);
        assert!(matches!(
            token.wait(Duration::from_millis(1)),
            Err(EnqueueError::Timeout(_))
        ));

        tag_buffer.write_u64(0, 2).unwrap();
        assert!(token.is_complete());
        token.wait(Duration::ZERO).unwrap();
        assert!(token.submission().is_none());
    }

    #[test]
    fn test_dependency_resolution() {
        let registry = AllocationRegistry::with_address_space(0x10_0000, 0x10_0000);
        let tag_buffer = registry.allocate(64, 64, AllocationKind::TagBuffer).unwrap();
        let token = CompletionToken::deferred(QueueId(1));
        token.set_submitted(SubmissionId::next(), 5, Arc::clone(&tag_buffer));
        let dependency = Dependency::from(&token);

        assert!(matches!(dependency.resolve(QueueId(1)), Resolution::Satisfied));
        assert!(matches!(
            dependency.resolve(QueueId(2)),
            Resolution::Wait { tag: 5, .. }
        ));

        let event = UserEvent::new();
        assert!(matches!(Dependency::from(&event).resolve(QueueId(1)), Resolution::Blocked));
        event.set_failed();
        assert!(matches!(Dependency::from(&event).resolve(QueueId(1)), Resolution::Failed));

        token.set_failed();
        assert!(matches!(dependency.resolve(QueueId(2)), Resolution::Failed));
    }
}
