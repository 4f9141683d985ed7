//! Binary instrumentation hook
//!
//! A profiling tool registers an [`InstrumentationHook`] with the device. It
//! sees every kernel binary at creation (and may replace it), may attach a
//! per-dispatch buffer surface at a binding-table slot it was told about, and
//! is notified when the command buffer carrying each dispatch completes.
//!
//! Completion notifications are driven by a FIFO of [`KernelExecution`]
//! records: appended at submit, tagged when the queue flushes, and drained
//! when the queue observes its tag pass.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::memory::{Allocation, ContextId, SubmissionId};
use crate::queue::QueueId;

/// Buffer a tool wants bound for one dispatch
#[derive(Debug, Clone)]
pub struct InstrumentationResource {
    pub allocation: Arc<Allocation>,
    pub binding_table_index: u32,
}

/// Callbacks of a profiling tool
pub trait InstrumentationHook: Send + Sync {
    /// Called once per kernel; returning a binary replaces the original
    fn on_kernel_create(
        &self,
        context: ContextId,
        simd_width: u32,
        binary: &[u8],
        binding_table_index: u32,
        shader_hash: u64,
    ) -> Option<Vec<u8>>;

    /// Called for every dispatch before its command buffer is submitted
    fn on_kernel_submit(&self, command_buffer: SubmissionId, kernel_id: u64) -> Option<InstrumentationResource>;

    fn on_command_buffer_complete(&self, command_buffer: SubmissionId);
}

/// One instrumented dispatch awaiting completion
#[derive(Debug, Clone)]
pub struct KernelExecution {
    pub submission: SubmissionId,
    pub queue: QueueId,
    pub kernel_id: u64,
    /// Completion tag, known once the queue flushed the dispatch
    pub tag: Option<u64>,
    pub resource: Option<InstrumentationResource>,
}

/// Device-wide instrumentation state
pub struct Instrumentation {
    hook: Box<dyn InstrumentationHook>,
    executions: Mutex<VecDeque<KernelExecution>>,
}

impl Instrumentation {
    pub fn new(hook: impl InstrumentationHook + 'static) -> Self {
        Self {
            hook: Box::new(hook),
            executions: Mutex::new(VecDeque::new()),
        }
    }

    pub(crate) fn kernel_created(
        &self,
        context: ContextId,
        simd_width: u32,
        binary: &[u8],
        binding_table_index: u32,
        shader_hash: u64,
    ) -> Option<Vec<u8>> {
        let replacement = self
            .hook
            .on_kernel_create(context, simd_width, binary, binding_table_index, shader_hash);
        if let Some(replaced) = &replacement {
            log::debug!(
                "instrumentation replaced kernel {shader_hash:#x} ({} -> {} bytes)",
                binary.len(),
                replaced.len()
            );
        }
        replacement
    }

    pub(crate) fn kernel_submitted(
        &self,
        queue: QueueId,
        submission: SubmissionId,
        kernel_id: u64,
    ) -> Option<InstrumentationResource> {
        let resource = self.hook.on_kernel_submit(submission, kernel_id);
        self.executions.lock().unwrap().push_back(KernelExecution {
            submission,
            queue,
            kernel_id,
            tag: None,
            resource: resource.clone(),
        });
        resource
    }

    /// Forget the records of a submission that never reached the device
    pub(crate) fn discard(&self, submission: SubmissionId) {
        self.executions
            .lock()
            .unwrap()
            .retain(|execution| execution.submission != submission);
    }

    /// Assign `tag` to the untagged records of `queue`
    pub(crate) fn flushed(&self, queue: QueueId, tag: u64) {
        for execution in self.executions.lock().unwrap().iter_mut() {
            if execution.queue == queue && execution.tag.is_none() {
                execution.tag = Some(tag);
            }
        }
    }

    /// Notify the tool of every record of `queue` at or below `tag`
    pub(crate) fn completed(&self, queue: QueueId, tag: u64) -> usize {
        let done: Vec<KernelExecution> = {
            let mut executions = self.executions.lock().unwrap();
            let (done, pending): (Vec<_>, Vec<_>) = executions
                .drain(..)
                .partition(|e| e.queue == queue && e.tag.is_some_and(|t| t <= tag));
            *executions = pending.into();
            done
        };
        // callbacks run without the lock so a tool may call back into the device
        for execution in &done {
            log::trace!(
                "instrumented kernel {} complete in submission {}",
                execution.kernel_id,
                execution.submission
            );
            self.hook.on_command_buffer_complete(execution.submission);
        }
        done.len()
    }

    pub fn pending(&self) -> usize {
        self.executions.lock().unwrap().len()
    }

    /// Remove every outstanding record
    pub fn drain(&self) -> Vec<KernelExecution> {
        self.executions.lock().unwrap().drain(..).collect()
    }
}

impl std::fmt::Debug for Instrumentation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instrumentation")
            .field("pending", &self.pending())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        completed: Mutex<Vec<SubmissionId>>,
    }

    impl InstrumentationHook for Arc<Recorder> {
        fn on_kernel_create(&self, _: ContextId, _: u32, binary: &[u8], _: u32, _: u64) -> Option<Vec<u8>> {
            let mut patched = binary.to_vec();
            patched.push(0xCC);
            Some(patched)
        }

        fn on_kernel_submit(&self, _: SubmissionId, _: u64) -> Option<InstrumentationResource> {
            None
        }

        fn on_command_buffer_complete(&self, command_buffer: SubmissionId) {
            self.completed.lock().unwrap().push(command_buffer);
        }
    }

    #[test]
    fn test_fifo_completes_by_queue_and_tag() {
        let recorder = Arc::new(Recorder::default());
        let instrumentation = Instrumentation::new(Arc::clone(&recorder));
        assert_eq!(
            instrumentation.kernel_created(ContextId(1), 16, &[1, 2], 3, 0xAB),
            Some(vec![1, 2, 0xCC])
        );

        let (a, b, c) = (SubmissionId::next(), SubmissionId::next(), SubmissionId::next());
        instrumentation.kernel_submitted(QueueId(1), a, 10);
        instrumentation.flushed(QueueId(1), 1);
        instrumentation.kernel_submitted(QueueId(2), b, 11);
        instrumentation.flushed(QueueId(2), 1);
        instrumentation.kernel_submitted(QueueId(1), c, 12);
        instrumentation.flushed(QueueId(1), 2);
        assert_eq!(instrumentation.pending(), 3);

        assert_eq!(instrumentation.completed(QueueId(1), 1), 1);
        assert_eq!(*recorder.completed.lock().unwrap(), vec![a]);
        assert_eq!(instrumentation.completed(QueueId(1), 5), 1);
        assert_eq!(instrumentation.pending(), 1);

        let remaining = instrumentation.drain();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].submission, b);
    }

    #[test]
    fn test_discard_drops_unsubmitted_records() {
        let instrumentation = Instrumentation::new(Arc::new(Recorder::default()));
        let submission = SubmissionId::next();
        instrumentation.kernel_submitted(QueueId(1), submission, 1);
        instrumentation.discard(submission);
        assert_eq!(instrumentation.pending(), 0);
        assert_eq!(instrumentation.completed(QueueId(1), u64::MAX), 0);
    }
}
