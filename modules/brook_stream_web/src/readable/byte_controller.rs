use std::{cell::RefCell, collections::VecDeque, fmt, rc::Rc};

use brook_utils::{
    buffer::copy_data_block_bytes, result::ResultExt, ArrayBuffer, ArrayBufferView, Ctx, Error,
    Promise, Result, Value, ViewKind,
};
use tracing::trace;

use super::{
    CancelAlgorithm, PullAlgorithm, ReadableStream, ReadableStreamReadIntoRequest,
    ReadableStreamReadRequest, ReadableStreamReader, ReadableStreamState, ReadableStreamWeak,
    StartAlgorithm,
};
use crate::utils::OperationState;

/// Lets a [`crate::readable::UnderlyingByteSource`] feed bytes into its stream, either by
/// enqueueing chunks or by writing straight into the buffer of a pending BYOB read.
#[derive(Clone)]
pub struct ReadableByteStreamController(Rc<RefCell<ReadableByteStreamControllerInner>>);

struct ReadableByteStreamControllerInner {
    auto_allocate_chunk_size: Option<usize>,
    byob_request: Option<ReadableStreamBYOBRequest>,
    cancel_algorithm: Option<CancelAlgorithm>,
    close_requested: bool,
    pull_state: OperationState,
    pull_algorithm: Option<PullAlgorithm<ReadableByteStreamController>>,
    pending_pull_intos: VecDeque<PullIntoDescriptor>,
    queue: VecDeque<ReadableByteStreamQueueEntry>,
    queue_total_size: usize,
    started: bool,
    strategy_hwm: f64,
    stream: ReadableStreamWeak,
    ctx: Ctx,
}

#[derive(Debug)]
struct ReadableByteStreamQueueEntry {
    buffer: ArrayBuffer,
    byte_offset: usize,
    byte_length: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReaderType {
    Default,
    Byob,
    None,
}

#[derive(Debug)]
struct PullIntoDescriptor {
    buffer: ArrayBuffer,
    buffer_byte_length: usize,
    byte_offset: usize,
    byte_length: usize,
    bytes_filled: usize,
    minimum_fill: usize,
    element_size: usize,
    view_kind: ViewKind,
    reader_type: ReaderType,
}

impl PullIntoDescriptor {
    // A zero minimum fill still waits for one whole element.
    fn ready_threshold(&self) -> usize {
        self.minimum_fill.max(self.element_size)
    }

    fn fill_from_queue(
        &mut self,
        queue: &mut VecDeque<ReadableByteStreamQueueEntry>,
        queue_total_size: &mut usize,
    ) -> Result<bool> {
        // Let maxBytesToCopy be min(controller.[[queueTotalSize]], pullIntoDescriptor’s byte length − pullIntoDescriptor’s bytes filled).
        let max_bytes_to_copy = (*queue_total_size).min(self.byte_length - self.bytes_filled);

        // Let maxBytesFilled be pullIntoDescriptor’s bytes filled + maxBytesToCopy.
        let max_bytes_filled = self.bytes_filled + max_bytes_to_copy;

        // Let totalBytesToCopyRemaining be maxBytesToCopy.
        let mut total_bytes_to_copy_remaining = max_bytes_to_copy;

        // Let ready be false.
        let mut ready = false;

        // Let remainderBytes be the remainder after dividing maxBytesFilled by pullIntoDescriptor’s element size.
        let remainder_bytes = max_bytes_filled % self.element_size;

        // Let maxAlignedBytes be maxBytesFilled − remainderBytes.
        let max_aligned_bytes = max_bytes_filled - remainder_bytes;

        // If maxAlignedBytes ≥ pullIntoDescriptor’s minimum fill,
        if max_aligned_bytes >= self.ready_threshold() {
            // Set totalBytesToCopyRemaining to maxAlignedBytes − pullIntoDescriptor’s bytes filled.
            total_bytes_to_copy_remaining = max_aligned_bytes - self.bytes_filled;
            // Set ready to true.
            ready = true;
        }

        // While totalBytesToCopyRemaining > 0,
        while total_bytes_to_copy_remaining > 0 {
            // Let headOfQueue be queue[0].
            let Some(head_of_queue) = queue.front_mut() else {
                break;
            };

            // Let bytesToCopy be min(totalBytesToCopyRemaining, headOfQueue’s byte length).
            let bytes_to_copy = total_bytes_to_copy_remaining.min(head_of_queue.byte_length);

            // Let destStart be pullIntoDescriptor’s byte offset + pullIntoDescriptor’s bytes filled.
            let dest_start = self.byte_offset + self.bytes_filled;

            // Perform ! CopyDataBlockBytes(pullIntoDescriptor’s buffer.[[ArrayBufferData]], destStart, headOfQueue’s buffer.[[ArrayBufferData]], headOfQueue’s byte offset, bytesToCopy).
            copy_data_block_bytes(
                &self.buffer,
                dest_start,
                &head_of_queue.buffer,
                head_of_queue.byte_offset,
                bytes_to_copy,
            )?;

            // If headOfQueue’s byte length is bytesToCopy,
            if head_of_queue.byte_length == bytes_to_copy {
                // Remove queue[0].
                queue.pop_front();
            } else {
                // Set headOfQueue’s byte offset to headOfQueue’s byte offset + bytesToCopy.
                head_of_queue.byte_offset += bytes_to_copy;
                // Set headOfQueue’s byte length to headOfQueue’s byte length − bytesToCopy.
                head_of_queue.byte_length -= bytes_to_copy;
            }

            // Set controller.[[queueTotalSize]] to controller.[[queueTotalSize]] − bytesToCopy.
            *queue_total_size -= bytes_to_copy;

            // Perform ! ReadableByteStreamControllerFillHeadPullIntoDescriptor(controller, bytesToCopy, pullIntoDescriptor).
            self.bytes_filled += bytes_to_copy;

            // Set totalBytesToCopyRemaining to totalBytesToCopyRemaining − bytesToCopy.
            total_bytes_to_copy_remaining -= bytes_to_copy;
        }

        // If ready is false,
        // Assert: controller.[[queueTotalSize]] is 0.
        // Assert: pullIntoDescriptor’s bytes filled > 0.
        // Assert: pullIntoDescriptor’s bytes filled < pullIntoDescriptor’s minimum fill.
        Ok(ready)
    }

    fn convert(self) -> Result<ArrayBufferView> {
        // Let bytesFilled be pullIntoDescriptor’s bytes filled.
        // Let elementSize be pullIntoDescriptor’s element size.
        // Assert: bytesFilled ≤ pullIntoDescriptor’s byte length.
        // Assert: the remainder after dividing bytesFilled by elementSize is 0.
        // Let buffer be ! TransferArrayBuffer(pullIntoDescriptor’s buffer).
        let buffer = self.buffer.transfer()?;

        // Return ! Construct(pullIntoDescriptor’s view constructor, « buffer, pullIntoDescriptor’s byte offset, bytesFilled ÷ elementSize »).
        ArrayBufferView::new(
            self.view_kind,
            buffer,
            self.byte_offset,
            self.bytes_filled / self.element_size,
        )
    }
}

impl ReadableByteStreamController {
    pub(super) fn new(
        ctx: &Ctx,
        pull_algorithm: PullAlgorithm<Self>,
        cancel_algorithm: CancelAlgorithm,
        high_water_mark: f64,
        auto_allocate_chunk_size: Option<usize>,
    ) -> Self {
        Self(Rc::new(RefCell::new(ReadableByteStreamControllerInner {
            // Set controller.[[pullAgain]] and controller.[[pulling]] to false.
            pull_state: OperationState::Idle,
            // Set controller.[[byobRequest]] to null.
            byob_request: None,
            // Perform ! ResetQueue(controller).
            queue: VecDeque::new(),
            queue_total_size: 0,
            // Set controller.[[closeRequested]] and controller.[[started]] to false.
            close_requested: false,
            started: false,
            // Set controller.[[strategyHWM]] to highWaterMark.
            strategy_hwm: high_water_mark,
            // Set controller.[[pullAlgorithm]] to pullAlgorithm.
            pull_algorithm: Some(pull_algorithm),
            // Set controller.[[cancelAlgorithm]] to cancelAlgorithm.
            cancel_algorithm: Some(cancel_algorithm),
            // Set controller.[[autoAllocateChunkSize]] to autoAllocateChunkSize.
            auto_allocate_chunk_size,
            // Set controller.[[pendingPullIntos]] to a new empty list.
            pending_pull_intos: VecDeque::new(),
            stream: ReadableStreamWeak::new(),
            ctx: ctx.clone(),
        })))
    }

    pub(super) fn set_up(
        &self,
        stream: &ReadableStream,
        start_algorithm: StartAlgorithm<Self>,
    ) -> Result<()> {
        // Set controller.[[stream]] to stream.
        self.0.borrow_mut().stream = stream.downgrade();

        let ctx = self.ctx();

        // Let startResult be the result of performing startAlgorithm.
        let start_result = start_algorithm.call(&ctx, self.clone())?;

        // Let startPromise be a promise resolved with startResult.
        let controller = self.clone();
        start_result.react(move |result| match result {
            // Upon fulfillment of startPromise,
            Ok(()) => {
                // Set controller.[[started]] to true.
                controller.0.borrow_mut().started = true;
                // Perform ! ReadableByteStreamControllerCallPullIfNeeded(controller).
                controller.readable_byte_stream_controller_call_pull_if_needed();
            },
            // Upon rejection of startPromise with reason r,
            // Perform ! ReadableByteStreamControllerError(controller, r).
            Err(r) => controller.readable_byte_stream_controller_error(r),
        });

        Ok(())
    }

    /// The request for the head pending BYOB read, if there is one. Responding to it writes
    /// directly into the reader's buffer.
    pub fn byob_request(&self) -> Option<ReadableStreamBYOBRequest> {
        self.readable_byte_stream_controller_get_byob_request()
    }

    pub fn desired_size(&self) -> Option<f64> {
        self.readable_byte_stream_controller_get_desired_size()
    }

    /// Closes the stream once queued bytes are consumed. Errors the stream instead if a
    /// pending BYOB read holds a partial element.
    pub fn close(&self) -> Result<()> {
        if !self.can_close_or_enqueue() {
            return Ok(());
        }

        // Perform ? ReadableByteStreamControllerClose(this).
        self.readable_byte_stream_controller_close()
    }

    /// Transfers `chunk`'s buffer into the stream.
    pub fn enqueue(&self, chunk: ArrayBufferView) -> Result<()> {
        if chunk.buffer().is_detached() {
            return Err(Error::detached("chunk's buffer is detached"));
        }

        // If chunk.[[ByteLength]] is 0, throw a TypeError exception.
        if chunk.byte_length() == 0 {
            return Err(Error::validation("chunk must have non-zero byteLength"));
        }

        // If chunk.[[ViewedArrayBuffer]].[[ArrayBufferByteLength]] is 0, throw a TypeError exception.
        if chunk.buffer().byte_length() == 0 {
            return Err(Error::validation(
                "chunk's buffer must have non-zero byteLength",
            ));
        }

        if !self.can_close_or_enqueue() {
            return Ok(());
        }

        // Return ? ReadableByteStreamControllerEnqueue(this, chunk).
        self.readable_byte_stream_controller_enqueue(chunk)
    }

    pub fn error(&self, e: impl Into<Value>) {
        // Perform ! ReadableByteStreamControllerError(this, e).
        self.readable_byte_stream_controller_error(e.into())
    }

    fn ctx(&self) -> Ctx {
        self.0.borrow().ctx.clone()
    }

    fn stream(&self) -> Option<ReadableStream> {
        self.0.borrow().stream.upgrade().map(ReadableStream)
    }

    fn can_close_or_enqueue(&self) -> bool {
        let Some(stream) = self.stream() else {
            return false;
        };
        !self.0.borrow().close_requested && stream.is_readable()
    }

    pub(crate) fn has_pending_pull_intos(&self) -> bool {
        !self.0.borrow().pending_pull_intos.is_empty()
    }

    pub(crate) fn readable_byte_stream_controller_get_byob_request(
        &self,
    ) -> Option<ReadableStreamBYOBRequest> {
        let mut inner = self.0.borrow_mut();

        // If controller.[[byobRequest]] is null and controller.[[pendingPullIntos]] is not empty,
        if inner.byob_request.is_none() {
            // Let firstDescriptor be controller.[[pendingPullIntos]][0].
            let first_descriptor = inner.pending_pull_intos.front()?;

            // Let view be ! Construct(%Uint8Array%, « firstDescriptor’s buffer, firstDescriptor’s byte offset + firstDescriptor’s bytes filled, firstDescriptor’s byte length − firstDescriptor’s bytes filled »).
            let view = ArrayBufferView::new(
                ViewKind::Uint8,
                first_descriptor.buffer.clone(),
                first_descriptor.byte_offset + first_descriptor.bytes_filled,
                first_descriptor.byte_length - first_descriptor.bytes_filled,
            )
            .ok()?;

            // Let byobRequest be a new ReadableStreamBYOBRequest.
            // Set byobRequest.[[controller]] to controller.
            // Set byobRequest.[[view]] to view.
            // Set controller.[[byobRequest]] to byobRequest.
            inner.byob_request = Some(ReadableStreamBYOBRequest(Rc::new(RefCell::new(
                ReadableStreamBYOBRequestInner {
                    controller: Some(self.clone()),
                    view: Some(view),
                },
            ))));
        }

        // Return controller.[[byobRequest]].
        inner.byob_request.clone()
    }

    pub(crate) fn readable_byte_stream_controller_get_desired_size(&self) -> Option<f64> {
        let state = self.stream()?.state();

        match state {
            // If state is "errored", return null.
            ReadableStreamState::Errored(_) => None,
            // If state is "closed", return 0.
            ReadableStreamState::Closed => Some(0.0),
            // Return controller.[[strategyHWM]] − controller.[[queueTotalSize]].
            ReadableStreamState::Readable => {
                let inner = self.0.borrow();
                Some(inner.strategy_hwm - inner.queue_total_size as f64)
            },
        }
    }

    fn readable_byte_stream_controller_call_pull_if_needed(&self) {
        // Let shouldPull be ! ReadableByteStreamControllerShouldCallPull(controller).
        // If shouldPull is false, return.
        if !self.readable_byte_stream_controller_should_call_pull() {
            return;
        }

        let pull_algorithm = {
            let mut inner = self.0.borrow_mut();
            // If controller.[[pulling]] is true,
            // Set controller.[[pullAgain]] to true.
            // Return.
            if !inner.pull_state.begin() {
                trace!("Byte pull already in flight, coalescing");
                return;
            }
            // Set controller.[[pulling]] to true.
            inner.pull_algorithm.clone()
        };

        let Some(pull_algorithm) = pull_algorithm else {
            self.0.borrow_mut().pull_state.finish();
            return;
        };

        trace!("Pulling from underlying byte source");

        // Let pullPromise be the result of performing controller.[[pullAlgorithm]].
        let pull_promise = pull_algorithm.call(&self.ctx(), self.clone());

        let controller = self.clone();
        pull_promise.react(move |result| match result {
            // Upon fulfillment of pullPromise,
            Ok(()) => {
                // Set controller.[[pulling]] to false.
                // If controller.[[pullAgain]] is true,
                if controller.0.borrow_mut().pull_state.finish() {
                    // Set controller.[[pullAgain]] to false.
                    // Perform ! ReadableByteStreamControllerCallPullIfNeeded(controller).
                    controller.readable_byte_stream_controller_call_pull_if_needed();
                }
            },
            // Upon rejection of pullPromise with reason e,
            // Perform ! ReadableByteStreamControllerError(controller, e).
            Err(e) => controller.readable_byte_stream_controller_error(e),
        });
    }

    fn readable_byte_stream_controller_should_call_pull(&self) -> bool {
        // Let stream be controller.[[stream]].
        let Some(stream) = self.stream() else {
            return false;
        };

        // If stream.[[state]] is not "readable", return false.
        if !stream.is_readable() {
            return false;
        }

        {
            let inner = self.0.borrow();
            // If controller.[[closeRequested]] is true, return false.
            // If controller.[[started]] is false, return false.
            if inner.close_requested || !inner.started {
                return false;
            }
        }

        // If ! ReadableStreamHasDefaultReader(stream) is true and ! ReadableStreamGetNumReadRequests(stream) > 0, return true.
        if stream.readable_stream_has_default_reader()
            && stream.readable_stream_get_num_read_requests() > 0
        {
            return true;
        }

        // If ! ReadableStreamHasBYOBReader(stream) is true and ! ReadableStreamGetNumReadIntoRequests(stream) > 0, return true.
        if stream.readable_stream_has_byob_reader()
            && stream.readable_stream_get_num_read_into_requests() > 0
        {
            return true;
        }

        // Let desiredSize be ! ReadableByteStreamControllerGetDesiredSize(controller).
        // If desiredSize > 0, return true.
        // Return false.
        self.readable_byte_stream_controller_get_desired_size()
            .is_some_and(|desired_size| desired_size > 0.0)
    }

    pub(crate) fn readable_byte_stream_controller_error(&self, e: Value) {
        // Let stream be controller.[[stream]].
        let Some(stream) = self.stream() else {
            return;
        };

        // If stream.[[state]] is not "readable", return.
        if !stream.is_readable() {
            return;
        }

        // Perform ! ReadableByteStreamControllerClearPendingPullIntos(controller).
        self.readable_byte_stream_controller_clear_pending_pull_intos();

        // Perform ! ResetQueue(controller).
        self.reset_queue();

        // Perform ! ReadableByteStreamControllerClearAlgorithms(controller).
        self.readable_byte_stream_controller_clear_algorithms();

        // Perform ! ReadableStreamError(stream, e).
        stream.readable_stream_error(e);
    }

    fn readable_byte_stream_controller_clear_pending_pull_intos(&self) {
        // Perform ! ReadableByteStreamControllerInvalidateBYOBRequest(controller).
        self.readable_byte_stream_controller_invalidate_byob_request();

        // Set controller.[[pendingPullIntos]] to a new empty list.
        self.0.borrow_mut().pending_pull_intos.clear();
    }

    fn readable_byte_stream_controller_invalidate_byob_request(&self) {
        // If controller.[[byobRequest]] is null, return.
        let Some(byob_request) = self.0.borrow_mut().byob_request.take() else {
            return;
        };

        // Set controller.[[byobRequest]].[[controller]] to undefined.
        // Set controller.[[byobRequest]].[[view]] to null.
        let mut byob_request = byob_request.0.borrow_mut();
        byob_request.controller = None;
        byob_request.view = None;
    }

    fn readable_byte_stream_controller_clear_algorithms(&self) {
        let mut inner = self.0.borrow_mut();
        // Set controller.[[pullAlgorithm]] to undefined.
        inner.pull_algorithm = None;
        // Set controller.[[cancelAlgorithm]] to undefined.
        inner.cancel_algorithm = None;
    }

    fn reset_queue(&self) {
        let mut inner = self.0.borrow_mut();
        inner.queue.clear();
        inner.queue_total_size = 0;
    }

    pub(crate) fn readable_byte_stream_controller_close(&self) -> Result<()> {
        // Let stream be controller.[[stream]].
        let Some(stream) = self.stream() else {
            return Ok(());
        };

        // If controller.[[closeRequested]] is true or stream.[[state]] is not "readable", return.
        if self.0.borrow().close_requested || !stream.is_readable() {
            return Ok(());
        }

        {
            let mut inner = self.0.borrow_mut();
            // If controller.[[queueTotalSize]] > 0,
            if inner.queue_total_size > 0 {
                // Set controller.[[closeRequested]] to true.
                inner.close_requested = true;
                // Return.
                return Ok(());
            }
        }

        // If controller.[[pendingPullIntos]] is not empty,
        // Let firstPendingPullInto be controller.[[pendingPullIntos]][0].
        // If the remainder after dividing firstPendingPullInto’s bytes filled by firstPendingPullInto’s element size is not 0,
        let partial_element = self
            .0
            .borrow()
            .pending_pull_intos
            .front()
            .is_some_and(|first| first.bytes_filled % first.element_size != 0);
        if partial_element {
            // Let e be a new TypeError exception.
            let e = Error::validation("Insufficient bytes to fill elements in the given buffer");
            // Perform ! ReadableByteStreamControllerError(controller, e).
            self.readable_byte_stream_controller_error(e.clone().into());
            // Throw e.
            return Err(e);
        }

        // Perform ! ReadableByteStreamControllerClearAlgorithms(controller).
        self.readable_byte_stream_controller_clear_algorithms();

        // Perform ! ReadableStreamClose(stream).
        stream.readable_stream_close();
        Ok(())
    }

    pub(crate) fn readable_byte_stream_controller_enqueue(
        &self,
        chunk: ArrayBufferView,
    ) -> Result<()> {
        // Let stream be controller.[[stream]].
        let Some(stream) = self.stream() else {
            return Ok(());
        };

        // If controller.[[closeRequested]] is true or stream.[[state]] is not "readable", return.
        if self.0.borrow().close_requested || !stream.is_readable() {
            return Ok(());
        }

        // Let buffer be chunk.[[ViewedArrayBuffer]].
        // Let byteOffset be chunk.[[ByteOffset]].
        // Let byteLength be chunk.[[ByteLength]].
        let byte_offset = chunk.byte_offset();
        let byte_length = chunk.byte_length();

        // If ! IsDetachedBuffer(buffer) is true, throw a TypeError exception.
        // Let transferredBuffer be ? TransferArrayBuffer(buffer).
        let transferred_buffer = chunk.buffer().clone().transfer()?;

        // If controller.[[pendingPullIntos]] is not empty,
        let first_reader_type = {
            let mut inner = self.0.borrow_mut();
            match inner.pending_pull_intos.front_mut() {
                Some(first_pending_pull_into) => {
                    // If ! IsDetachedBuffer(firstPendingPullInto’s buffer) is true, throw a TypeError exception.
                    // Set firstPendingPullInto’s buffer to ! TransferArrayBuffer(firstPendingPullInto’s buffer).
                    first_pending_pull_into.buffer =
                        first_pending_pull_into.buffer.clone().transfer()?;
                    Some(first_pending_pull_into.reader_type)
                },
                None => None,
            }
        };

        if let Some(first_reader_type) = first_reader_type {
            // Perform ! ReadableByteStreamControllerInvalidateBYOBRequest(controller).
            self.readable_byte_stream_controller_invalidate_byob_request();

            // If firstPendingPullInto’s reader type is "none", perform ? ReadableByteStreamControllerEnqueueDetachedPullIntoToQueue(controller, firstPendingPullInto).
            if first_reader_type == ReaderType::None {
                self.readable_byte_stream_controller_enqueue_detached_pull_into_to_queue()?;
            }
        }

        // If ! ReadableStreamHasDefaultReader(stream) is true,
        if stream.readable_stream_has_default_reader() {
            // Perform ! ReadableByteStreamControllerProcessReadRequestsUsingQueue(controller).
            self.readable_byte_stream_controller_process_read_requests_using_queue(&stream);

            // If ! ReadableStreamGetNumReadRequests(stream) is 0,
            if stream.readable_stream_get_num_read_requests() == 0 {
                // Assert: controller.[[pendingPullIntos]] is empty.
                // Perform ! ReadableByteStreamControllerEnqueueChunkToQueue(controller, transferredBuffer, byteOffset, byteLength).
                self.readable_byte_stream_controller_enqueue_chunk_to_queue(
                    transferred_buffer,
                    byte_offset,
                    byte_length,
                );
            } else {
                // Assert: controller.[[queue]] is empty.
                // If controller.[[pendingPullIntos]] is not empty,
                if self.has_pending_pull_intos() {
                    // Assert: controller.[[pendingPullIntos]][0]'s reader type is "default".
                    // Perform ! ReadableByteStreamControllerShiftPendingPullInto(controller).
                    self.readable_byte_stream_controller_shift_pending_pull_into();
                }

                // Let transferredView be ! Construct(%Uint8Array%, « transferredBuffer, byteOffset, byteLength »).
                let transferred_view = ArrayBufferView::new(
                    ViewKind::Uint8,
                    transferred_buffer,
                    byte_offset,
                    byte_length,
                )?;

                // Perform ! ReadableStreamFulfillReadRequest(stream, transferredView, false).
                stream.readable_stream_fulfill_read_request(Value::Bytes(transferred_view), false);
            }
        // Otherwise, if ! ReadableStreamHasBYOBReader(stream) is true,
        } else if stream.readable_stream_has_byob_reader() {
            // Perform ! ReadableByteStreamControllerEnqueueChunkToQueue(controller, transferredBuffer, byteOffset, byteLength).
            self.readable_byte_stream_controller_enqueue_chunk_to_queue(
                transferred_buffer,
                byte_offset,
                byte_length,
            );

            // Let filledPullIntos be the result of performing ! ReadableByteStreamControllerProcessPullIntoDescriptorsUsingQueue(controller).
            let filled_pull_intos =
                self.readable_byte_stream_controller_process_pull_into_descriptors_using_queue()?;

            // For each filledPullInto of filledPullIntos,
            for filled_pull_into in filled_pull_intos {
                // Perform ! ReadableByteStreamControllerCommitPullIntoDescriptor(stream, filledPullInto).
                Self::readable_byte_stream_controller_commit_pull_into_descriptor(
                    &stream,
                    filled_pull_into,
                )?;
            }
        } else {
            // Assert: ! IsReadableStreamLocked(stream) is false.
            // Perform ! ReadableByteStreamControllerEnqueueChunkToQueue(controller, transferredBuffer, byteOffset, byteLength).
            self.readable_byte_stream_controller_enqueue_chunk_to_queue(
                transferred_buffer,
                byte_offset,
                byte_length,
            );
        }

        // Perform ! ReadableByteStreamControllerCallPullIfNeeded(controller).
        self.readable_byte_stream_controller_call_pull_if_needed();
        Ok(())
    }

    fn readable_byte_stream_controller_enqueue_detached_pull_into_to_queue(&self) -> Result<()> {
        let head = {
            let inner = self.0.borrow();
            inner
                .pending_pull_intos
                .front()
                .map(|d| (d.buffer.clone(), d.byte_offset, d.bytes_filled))
        };
        let Some((buffer, byte_offset, bytes_filled)) = head else {
            return Ok(());
        };

        // If pullIntoDescriptor’s bytes filled > 0, perform ? ReadableByteStreamControllerEnqueueClonedChunkToQueue(controller, pullIntoDescriptor’s buffer, pullIntoDescriptor’s byte offset, pullIntoDescriptor’s bytes filled).
        if bytes_filled > 0 {
            self.readable_byte_stream_controller_enqueue_cloned_chunk_to_queue(
                &buffer,
                byte_offset,
                bytes_filled,
            )?;
        }

        // Perform ! ReadableByteStreamControllerShiftPendingPullInto(controller).
        self.readable_byte_stream_controller_shift_pending_pull_into();
        Ok(())
    }

    fn readable_byte_stream_controller_process_read_requests_using_queue(
        &self,
        stream: &ReadableStream,
    ) {
        // While reader.[[readRequests]] is not empty,
        while stream.readable_stream_get_num_read_requests() > 0 {
            // If controller.[[queueTotalSize]] is 0, return.
            if self.0.borrow().queue_total_size == 0 {
                return;
            }

            // Let readRequest be reader.[[readRequests]][0].
            // Remove readRequest from reader.[[readRequests]].
            let Some(ReadableStreamReader::Default(reader)) = stream.reader() else {
                return;
            };
            let Some(read_request) = reader.pop_read_request() else {
                return;
            };

            // Perform ! ReadableByteStreamControllerFillReadRequestFromQueue(controller, readRequest).
            self.readable_byte_stream_controller_fill_read_request_from_queue(read_request);
        }
    }

    fn readable_byte_stream_controller_shift_pending_pull_into(
        &self,
    ) -> Option<PullIntoDescriptor> {
        // Let descriptor be controller.[[pendingPullIntos]][0].
        // Remove descriptor from controller.[[pendingPullIntos]].
        // Return descriptor.
        self.0.borrow_mut().pending_pull_intos.pop_front()
    }

    fn readable_byte_stream_controller_enqueue_chunk_to_queue(
        &self,
        buffer: ArrayBuffer,
        byte_offset: usize,
        byte_length: usize,
    ) {
        let mut inner = self.0.borrow_mut();
        // Append a new readable byte stream queue entry with buffer buffer, byte offset byteOffset, and byte length byteLength to controller.[[queue]].
        inner.queue.push_back(ReadableByteStreamQueueEntry {
            buffer,
            byte_offset,
            byte_length,
        });

        // Set controller.[[queueTotalSize]] to controller.[[queueTotalSize]] + byteLength.
        inner.queue_total_size += byte_length;
    }

    fn readable_byte_stream_controller_process_pull_into_descriptors_using_queue(
        &self,
    ) -> Result<Vec<PullIntoDescriptor>> {
        // Let filledPullIntos be a new empty list.
        let mut filled_pull_intos = Vec::new();

        let mut inner = self.0.borrow_mut();
        let inner = &mut *inner;

        // While controller.[[pendingPullIntos]] is not empty,
        loop {
            // If controller.[[queueTotalSize]] is 0, then break.
            if inner.queue_total_size == 0 {
                break;
            }

            // Let pullIntoDescriptor be controller.[[pendingPullIntos]][0].
            let Some(pull_into_descriptor) = inner.pending_pull_intos.front_mut() else {
                break;
            };

            // If ! ReadableByteStreamControllerFillPullIntoDescriptorFromQueue(controller, pullIntoDescriptor) is true,
            if pull_into_descriptor.fill_from_queue(&mut inner.queue, &mut inner.queue_total_size)?
            {
                // Perform ! ReadableByteStreamControllerShiftPendingPullInto(controller).
                // Append pullIntoDescriptor to filledPullIntos.
                if let Some(pull_into_descriptor) = inner.pending_pull_intos.pop_front() {
                    filled_pull_intos.push(pull_into_descriptor);
                }
            }
        }

        // Return filledPullIntos.
        Ok(filled_pull_intos)
    }

    fn readable_byte_stream_controller_enqueue_cloned_chunk_to_queue(
        &self,
        buffer: &ArrayBuffer,
        byte_offset: usize,
        byte_length: usize,
    ) -> Result<()> {
        // Let cloneResult be CloneArrayBuffer(buffer, byteOffset, byteLength, %ArrayBuffer%).
        match buffer.duplicate(byte_offset, byte_length) {
            // Perform ! ReadableByteStreamControllerEnqueueChunkToQueue(controller, cloneResult.[[Value]], 0, byteLength).
            Ok(clone) => {
                self.readable_byte_stream_controller_enqueue_chunk_to_queue(clone, 0, byte_length);
                Ok(())
            },
            // If cloneResult is an abrupt completion,
            Err(err) => {
                // Perform ! ReadableByteStreamControllerError(controller, cloneResult.[[Value]]).
                self.readable_byte_stream_controller_error(err.clone().into());
                // Return cloneResult.
                Err(err)
            },
        }
    }

    fn readable_byte_stream_controller_fill_read_request_from_queue(
        &self,
        read_request: Box<dyn ReadableStreamReadRequest>,
    ) {
        let entry = {
            let mut inner = self.0.borrow_mut();
            // Let entry be controller.[[queue]][0].
            // Remove entry from controller.[[queue]].
            let entry = inner.queue.pop_front();
            // Set controller.[[queueTotalSize]] to controller.[[queueTotalSize]] − entry’s byte length.
            if let Some(entry) = &entry {
                inner.queue_total_size -= entry.byte_length;
            }
            entry
        };

        let Some(entry) = entry else {
            return;
        };

        // Perform ! ReadableByteStreamControllerHandleQueueDrain(controller).
        self.readable_byte_stream_controller_handle_queue_drain();

        // Let view be ! Construct(%Uint8Array%, « entry’s buffer, entry’s byte offset, entry’s byte length »).
        match ArrayBufferView::new(
            ViewKind::Uint8,
            entry.buffer,
            entry.byte_offset,
            entry.byte_length,
        ) {
            // Perform readRequest’s chunk steps, given view.
            Ok(view) => read_request.chunk_steps(Value::Bytes(view)),
            Err(err) => read_request.error_steps(err.into()),
        }
    }

    fn readable_byte_stream_controller_commit_pull_into_descriptor(
        stream: &ReadableStream,
        pull_into_descriptor: PullIntoDescriptor,
    ) -> Result<()> {
        // Let done be false.
        // If stream.[[state]] is "closed",
        // Assert: the remainder after dividing pullIntoDescriptor’s bytes filled by pullIntoDescriptor’s element size is 0.
        // Set done to true.
        let done = matches!(stream.state(), ReadableStreamState::Closed);
        let reader_type = pull_into_descriptor.reader_type;

        // Let filledView be ! ReadableByteStreamControllerConvertPullIntoDescriptor(pullIntoDescriptor).
        let filled_view = pull_into_descriptor.convert()?;

        match reader_type {
            // If pullIntoDescriptor’s reader type is "default",
            // Perform ! ReadableStreamFulfillReadRequest(stream, filledView, done).
            ReaderType::Default => {
                stream.readable_stream_fulfill_read_request(Value::Bytes(filled_view), done)
            },
            // Otherwise,
            // Perform ! ReadableStreamFulfillReadIntoRequest(stream, filledView, done).
            ReaderType::Byob => stream.readable_stream_fulfill_read_into_request(filled_view, done),
            ReaderType::None => {},
        }
        Ok(())
    }

    fn readable_byte_stream_controller_handle_queue_drain(&self) {
        let (queue_total_size, close_requested) = {
            let inner = self.0.borrow();
            (inner.queue_total_size, inner.close_requested)
        };

        // If controller.[[queueTotalSize]] is 0 and controller.[[closeRequested]] is true,
        if queue_total_size == 0 && close_requested {
            // Perform ! ReadableByteStreamControllerClearAlgorithms(controller).
            self.readable_byte_stream_controller_clear_algorithms();
            // Perform ! ReadableStreamClose(controller.[[stream]]).
            if let Some(stream) = self.stream() {
                stream.readable_stream_close();
            }
        } else {
            // Otherwise,
            // Perform ! ReadableByteStreamControllerCallPullIfNeeded(controller).
            self.readable_byte_stream_controller_call_pull_if_needed();
        }
    }

    pub(crate) fn readable_byte_stream_controller_pull_into(
        &self,
        view: ArrayBufferView,
        min: usize,
        read_into_request: Box<dyn ReadableStreamReadIntoRequest>,
    ) {
        // Let stream be controller.[[stream]].
        let Some(stream) = self.stream() else {
            return;
        };

        // Let elementSize be 1.
        // Let ctor be %DataView%.
        // If view has a [[TypedArrayName]] internal slot (i.e., it is not a DataView),
        // Set elementSize to the element size specified in the typed array constructors table for view.[[TypedArrayName]].
        // Set ctor to the constructor specified in the typed array constructors table for view.[[TypedArrayName]].
        let element_size = view.element_size();
        let view_kind = view.kind();

        // Let minimumFill be min × elementSize.
        // Assert: minimumFill ≥ 0 and minimumFill ≤ view.[[ByteLength]].
        // Assert: the remainder after dividing minimumFill by elementSize is 0.
        let minimum_fill = min * element_size;

        // Let byteOffset be view.[[ByteOffset]].
        // Let byteLength be view.[[ByteLength]].
        let byte_offset = view.byte_offset();
        let byte_length = view.byte_length();

        // Let bufferResult be TransferArrayBuffer(view.[[ViewedArrayBuffer]]).
        let buffer = match view.buffer().clone().transfer() {
            Ok(buffer) => buffer,
            // If bufferResult is an abrupt completion,
            Err(err) => {
                // Perform readIntoRequest’s error steps, given bufferResult.[[Value]].
                read_into_request.error_steps(err.into());
                // Return.
                return;
            },
        };

        // Let pullIntoDescriptor be a new pull-into descriptor with...
        let mut pull_into_descriptor = PullIntoDescriptor {
            buffer_byte_length: buffer.byte_length(),
            buffer,
            byte_offset,
            byte_length,
            bytes_filled: 0,
            minimum_fill,
            element_size,
            view_kind,
            reader_type: ReaderType::Byob,
        };

        // If controller.[[pendingPullIntos]] is not empty,
        if self.has_pending_pull_intos() {
            // Append pullIntoDescriptor to controller.[[pendingPullIntos]].
            self.0
                .borrow_mut()
                .pending_pull_intos
                .push_back(pull_into_descriptor);

            // Perform ! ReadableStreamAddReadIntoRequest(stream, readIntoRequest).
            stream.readable_stream_add_read_into_request(read_into_request);

            // Return.
            return;
        }

        // If stream.[[state]] is "closed",
        if matches!(stream.state(), ReadableStreamState::Closed) {
            // Let emptyView be ! Construct(ctor, « pullIntoDescriptor’s buffer, pullIntoDescriptor’s byte offset, 0 »).
            match ArrayBufferView::new(view_kind, pull_into_descriptor.buffer, byte_offset, 0) {
                // Perform readIntoRequest’s close steps, given emptyView.
                Ok(empty_view) => read_into_request.close_steps(Some(empty_view)),
                Err(err) => read_into_request.error_steps(err.into()),
            }

            // Return.
            return;
        }

        // If controller.[[queueTotalSize]] > 0,
        if self.0.borrow().queue_total_size > 0 {
            let ready = {
                let mut inner = self.0.borrow_mut();
                let inner = &mut *inner;
                pull_into_descriptor.fill_from_queue(&mut inner.queue, &mut inner.queue_total_size)
            };

            match ready {
                // If ! ReadableByteStreamControllerFillPullIntoDescriptorFromQueue(controller, pullIntoDescriptor) is true,
                Ok(true) => {
                    // Let filledView be ! ReadableByteStreamControllerConvertPullIntoDescriptor(pullIntoDescriptor).
                    let filled_view = pull_into_descriptor.convert();

                    // Perform ! ReadableByteStreamControllerHandleQueueDrain(controller).
                    self.readable_byte_stream_controller_handle_queue_drain();

                    // Perform readIntoRequest’s chunk steps, given filledView.
                    match filled_view {
                        Ok(filled_view) => read_into_request.chunk_steps(filled_view),
                        Err(err) => read_into_request.error_steps(err.into()),
                    }

                    // Return.
                    return;
                },
                Ok(false) => {},
                Err(err) => {
                    self.readable_byte_stream_controller_error(err.clone().into());
                    read_into_request.error_steps(err.into());
                    return;
                },
            }

            // If controller.[[closeRequested]] is true,
            if self.0.borrow().close_requested {
                // Let e be a TypeError exception.
                let e: Value =
                    Error::validation("Insufficient bytes to fill elements in the given buffer")
                        .into();

                // Perform ! ReadableByteStreamControllerError(controller, e).
                self.readable_byte_stream_controller_error(e.clone());

                // Perform readIntoRequest’s error steps, given e.
                read_into_request.error_steps(e);

                // Return.
                return;
            }
        }

        // Append pullIntoDescriptor to controller.[[pendingPullIntos]].
        self.0
            .borrow_mut()
            .pending_pull_intos
            .push_back(pull_into_descriptor);

        // Perform ! ReadableStreamAddReadIntoRequest(stream, readIntoRequest).
        stream.readable_stream_add_read_into_request(read_into_request);

        // Perform ! ReadableByteStreamControllerCallPullIfNeeded(controller).
        self.readable_byte_stream_controller_call_pull_if_needed();
    }

    pub(crate) fn readable_byte_stream_controller_respond(&self, bytes_written: usize) -> Result<()> {
        let Some(stream) = self.stream() else {
            return Ok(());
        };
        let closed = matches!(stream.state(), ReadableStreamState::Closed);

        {
            let mut inner = self.0.borrow_mut();
            // Assert: controller.[[pendingPullIntos]] is not empty.
            // Let firstDescriptor be controller.[[pendingPullIntos]][0].
            let Some(first_descriptor) = inner.pending_pull_intos.front_mut() else {
                return Err(Error::state("There is no pending read to respond to"));
            };

            if closed {
                // If bytesWritten is not 0, throw a TypeError exception.
                if bytes_written != 0 {
                    return Err(Error::validation(
                        "bytesWritten must be 0 when calling respond() on a closed stream",
                    ));
                }
            } else {
                // If bytesWritten is 0, throw a TypeError exception.
                if bytes_written == 0 {
                    return Err(Error::validation(
                        "bytesWritten must be greater than 0 when calling respond() on a readable stream",
                    ));
                }

                // If firstDescriptor’s bytes filled + bytesWritten > firstDescriptor’s byte length, throw a RangeError exception.
                if first_descriptor.bytes_filled + bytes_written > first_descriptor.byte_length {
                    return Err(Error::validation("bytesWritten out of range"));
                }
            }

            // Set firstDescriptor’s buffer to ! TransferArrayBuffer(firstDescriptor’s buffer).
            first_descriptor.buffer = first_descriptor.buffer.clone().transfer()?;
        }

        // Perform ? ReadableByteStreamControllerRespondInternal(controller, bytesWritten).
        self.readable_byte_stream_controller_respond_internal(&stream, bytes_written)
    }

    pub(crate) fn readable_byte_stream_controller_respond_with_new_view(
        &self,
        view: ArrayBufferView,
    ) -> Result<()> {
        let Some(stream) = self.stream() else {
            return Ok(());
        };
        let closed = matches!(stream.state(), ReadableStreamState::Closed);
        let view_byte_length = view.byte_length();

        {
            let mut inner = self.0.borrow_mut();
            // Assert: controller.[[pendingPullIntos]] is not empty.
            // Let firstDescriptor be controller.[[pendingPullIntos]][0].
            let Some(first_descriptor) = inner.pending_pull_intos.front_mut() else {
                return Err(Error::state("There is no pending read to respond to"));
            };

            if closed {
                // If view.[[ByteLength]] is not 0, throw a TypeError exception.
                if view_byte_length != 0 {
                    return Err(Error::validation(
                        "The view's length must be 0 when calling respondWithNewView() on a closed stream",
                    ));
                }
            } else if view_byte_length == 0 {
                // If view.[[ByteLength]] is 0, throw a TypeError exception.
                return Err(Error::validation(
                    "The view's length must be greater than 0 when calling respondWithNewView() on a readable stream",
                ));
            }

            // If firstDescriptor’s byte offset + firstDescriptor’ bytes filled is not view.[[ByteOffset]], throw a RangeError exception.
            if first_descriptor.byte_offset + first_descriptor.bytes_filled != view.byte_offset() {
                return Err(Error::validation(
                    "The region specified by view does not match byobRequest",
                ));
            }

            // If firstDescriptor’s buffer byte length is not view.[[ViewedArrayBuffer]].[[ByteLength]], throw a RangeError exception.
            if first_descriptor.buffer_byte_length != view.buffer().byte_length() {
                return Err(Error::validation(
                    "The buffer of view has different capacity than byobRequest",
                ));
            }

            // If firstDescriptor’s bytes filled + view.[[ByteLength]] > firstDescriptor’s byte length, throw a RangeError exception.
            if first_descriptor.bytes_filled + view_byte_length > first_descriptor.byte_length {
                return Err(Error::validation(
                    "The region specified by view is larger than byobRequest",
                ));
            }

            // Set firstDescriptor’s buffer to ? TransferArrayBuffer(view.[[ViewedArrayBuffer]]).
            first_descriptor.buffer = view.buffer().clone().transfer()?;
        }

        // Perform ? ReadableByteStreamControllerRespondInternal(controller, viewByteLength).
        self.readable_byte_stream_controller_respond_internal(&stream, view_byte_length)
    }

    fn readable_byte_stream_controller_respond_internal(
        &self,
        stream: &ReadableStream,
        bytes_written: usize,
    ) -> Result<()> {
        // Perform ! ReadableByteStreamControllerInvalidateBYOBRequest(controller).
        self.readable_byte_stream_controller_invalidate_byob_request();

        // If state is "closed",
        if matches!(stream.state(), ReadableStreamState::Closed) {
            // Assert: bytesWritten is 0.
            // Perform ! ReadableByteStreamControllerRespondInClosedState(controller, firstDescriptor).
            self.readable_byte_stream_controller_respond_in_closed_state(stream)?;
        } else {
            // Assert: state is "readable".
            // Assert: bytesWritten > 0.
            // Perform ? ReadableByteStreamControllerRespondInReadableState(controller, bytesWritten, firstDescriptor).
            self.readable_byte_stream_controller_respond_in_readable_state(stream, bytes_written)?;
        }

        // Perform ! ReadableByteStreamControllerCallPullIfNeeded(controller).
        self.readable_byte_stream_controller_call_pull_if_needed();
        Ok(())
    }

    fn readable_byte_stream_controller_respond_in_closed_state(
        &self,
        stream: &ReadableStream,
    ) -> Result<()> {
        // If firstDescriptor’s reader type is "none", perform ! ReadableByteStreamControllerShiftPendingPullInto(controller).
        let first_is_detached = self
            .0
            .borrow()
            .pending_pull_intos
            .front()
            .is_some_and(|first| first.reader_type == ReaderType::None);
        if first_is_detached {
            self.readable_byte_stream_controller_shift_pending_pull_into();
        }

        // If ! ReadableStreamHasBYOBReader(stream) is true,
        if stream.readable_stream_has_byob_reader() {
            // Let filledPullIntos be a new empty list.
            let mut filled_pull_intos = Vec::new();

            // While filledPullIntos’s size < ! ReadableStreamGetNumReadIntoRequests(stream),
            while filled_pull_intos.len() < stream.readable_stream_get_num_read_into_requests() {
                // Let pullIntoDescriptor be ! ReadableByteStreamControllerShiftPendingPullInto(controller).
                let Some(pull_into_descriptor) =
                    self.readable_byte_stream_controller_shift_pending_pull_into()
                else {
                    break;
                };
                // Append pullIntoDescriptor to filledPullIntos.
                filled_pull_intos.push(pull_into_descriptor);
            }

            // For each filledPullInto of filledPullIntos,
            for filled_pull_into in filled_pull_intos {
                // Perform ! ReadableByteStreamControllerCommitPullIntoDescriptor(stream, filledPullInto).
                Self::readable_byte_stream_controller_commit_pull_into_descriptor(
                    stream,
                    filled_pull_into,
                )?;
            }
        }
        Ok(())
    }

    fn readable_byte_stream_controller_respond_in_readable_state(
        &self,
        stream: &ReadableStream,
        bytes_written: usize,
    ) -> Result<()> {
        let (reader_type, bytes_filled, ready_threshold) = {
            let mut inner = self.0.borrow_mut();
            let Some(first) = inner.pending_pull_intos.front_mut() else {
                return Ok(());
            };
            // Assert: pullIntoDescriptor’s bytes filled + bytesWritten ≤ pullIntoDescriptor’s byte length.
            // Perform ! ReadableByteStreamControllerFillHeadPullIntoDescriptor(controller, bytesWritten, pullIntoDescriptor).
            first.bytes_filled += bytes_written;
            (first.reader_type, first.bytes_filled, first.ready_threshold())
        };

        // If pullIntoDescriptor’s reader type is "none",
        if reader_type == ReaderType::None {
            // Perform ? ReadableByteStreamControllerEnqueueDetachedPullIntoToQueue(controller, pullIntoDescriptor).
            self.readable_byte_stream_controller_enqueue_detached_pull_into_to_queue()?;

            // Let filledPullIntos be the result of performing ! ReadableByteStreamControllerProcessPullIntoDescriptorsUsingQueue(controller).
            let filled_pull_intos =
                self.readable_byte_stream_controller_process_pull_into_descriptors_using_queue()?;

            // For each filledPullInto of filledPullIntos,
            for filled_pull_into in filled_pull_intos {
                // Perform ! ReadableByteStreamControllerCommitPullIntoDescriptor(controller.[[stream]], filledPullInto).
                Self::readable_byte_stream_controller_commit_pull_into_descriptor(
                    stream,
                    filled_pull_into,
                )?;
            }

            // Return.
            return Ok(());
        }

        // If pullIntoDescriptor’s bytes filled < pullIntoDescriptor’s minimum fill, return.
        if bytes_filled < ready_threshold {
            return Ok(());
        }

        // Perform ! ReadableByteStreamControllerShiftPendingPullInto(controller).
        let Some(mut pull_into_descriptor) =
            self.readable_byte_stream_controller_shift_pending_pull_into()
        else {
            return Ok(());
        };

        // Let remainderSize be the remainder after dividing pullIntoDescriptor’s bytes filled by pullIntoDescriptor’s element size.
        let remainder_size = pull_into_descriptor.bytes_filled % pull_into_descriptor.element_size;

        // If remainderSize > 0,
        if remainder_size > 0 {
            // Let end be pullIntoDescriptor’s byte offset + pullIntoDescriptor’s bytes filled.
            let end = pull_into_descriptor.byte_offset + pull_into_descriptor.bytes_filled;

            // Perform ? ReadableByteStreamControllerEnqueueClonedChunkToQueue(controller, pullIntoDescriptor’s buffer, end − remainderSize, remainderSize).
            self.readable_byte_stream_controller_enqueue_cloned_chunk_to_queue(
                &pull_into_descriptor.buffer,
                end - remainder_size,
                remainder_size,
            )?;
        }

        // Set pullIntoDescriptor’s bytes filled to pullIntoDescriptor’s bytes filled − remainderSize.
        pull_into_descriptor.bytes_filled -= remainder_size;

        // Let filledPullIntos be the result of performing ! ReadableByteStreamControllerProcessPullIntoDescriptorsUsingQueue(controller).
        let filled_pull_intos =
            self.readable_byte_stream_controller_process_pull_into_descriptors_using_queue()?;

        // Perform ! ReadableByteStreamControllerCommitPullIntoDescriptor(controller.[[stream]], pullIntoDescriptor).
        Self::readable_byte_stream_controller_commit_pull_into_descriptor(
            stream,
            pull_into_descriptor,
        )?;

        // For each filledPullInto of filledPullIntos,
        for filled_pull_into in filled_pull_intos {
            // Perform ! ReadableByteStreamControllerCommitPullIntoDescriptor(controller.[[stream]], filledPullInto).
            Self::readable_byte_stream_controller_commit_pull_into_descriptor(
                stream,
                filled_pull_into,
            )?;
        }

        Ok(())
    }

    pub(super) fn pull_steps(&self, read_request: Box<dyn ReadableStreamReadRequest>) {
        // Let stream be this.[[stream]].
        let Some(stream) = self.stream() else {
            return;
        };

        // Assert: ! ReadableStreamHasDefaultReader(stream) is true.
        // If this.[[queueTotalSize]] > 0,
        if self.0.borrow().queue_total_size > 0 {
            // Assert: ! ReadableStreamGetNumReadRequests(stream) is 0.
            // Perform ! ReadableByteStreamControllerFillReadRequestFromQueue(this, readRequest).
            self.readable_byte_stream_controller_fill_read_request_from_queue(read_request);
            // Return.
            return;
        }

        // Let autoAllocateChunkSize be this.[[autoAllocateChunkSize]].
        // If autoAllocateChunkSize is not undefined,
        let auto_allocate_chunk_size = self.0.borrow().auto_allocate_chunk_size;
        if let Some(auto_allocate_chunk_size) = auto_allocate_chunk_size {
            // Let buffer be Construct(%ArrayBuffer%, « autoAllocateChunkSize »).
            let buffer = ArrayBuffer::new(auto_allocate_chunk_size);

            // Let pullIntoDescriptor be a new pull-into descriptor with...
            // Append pullIntoDescriptor to this.[[pendingPullIntos]].
            self.0
                .borrow_mut()
                .pending_pull_intos
                .push_back(PullIntoDescriptor {
                    buffer,
                    buffer_byte_length: auto_allocate_chunk_size,
                    byte_offset: 0,
                    byte_length: auto_allocate_chunk_size,
                    bytes_filled: 0,
                    minimum_fill: 1,
                    element_size: 1,
                    view_kind: ViewKind::Uint8,
                    reader_type: ReaderType::Default,
                });
        }

        // Perform ! ReadableStreamAddReadRequest(stream, readRequest).
        stream.readable_stream_add_read_request(read_request);

        // Perform ! ReadableByteStreamControllerCallPullIfNeeded(this).
        self.readable_byte_stream_controller_call_pull_if_needed();
    }

    pub(super) fn cancel_steps(&self, reason: Value) -> Promise<()> {
        // Perform ! ReadableByteStreamControllerClearPendingPullIntos(this).
        self.readable_byte_stream_controller_clear_pending_pull_intos();

        // Perform ! ResetQueue(this).
        self.reset_queue();

        // Let result be the result of performing this.[[cancelAlgorithm]], passing in reason.
        let cancel_algorithm = self.0.borrow().cancel_algorithm.clone();

        // Perform ! ReadableByteStreamControllerClearAlgorithms(this).
        self.readable_byte_stream_controller_clear_algorithms();

        // Return result.
        cancel_algorithm
            .unwrap_or(CancelAlgorithm::ReturnPromiseUndefined)
            .call(&self.ctx(), reason)
    }

    pub(super) fn release_steps(&self) {
        let mut inner = self.0.borrow_mut();

        // If this.[[pendingPullIntos]] is not empty,
        // Let firstPendingPullInto be this.[[pendingPullIntos]][0].
        if let Some(mut first_pending_pull_into) = inner.pending_pull_intos.pop_front() {
            // Set firstPendingPullInto’s reader type to "none".
            first_pending_pull_into.reader_type = ReaderType::None;

            // Set this.[[pendingPullIntos]] to the list « firstPendingPullInto ».
            inner.pending_pull_intos.clear();
            inner.pending_pull_intos.push_back(first_pending_pull_into);
        }
    }

    #[cfg(test)]
    fn queue_total_size(&self) -> usize {
        self.0.borrow().queue_total_size
    }
}

impl fmt::Debug for ReadableByteStreamController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.0.borrow();
        f.debug_struct("ReadableByteStreamController")
            .field("queue_total_size", &inner.queue_total_size)
            .field("pending_pull_intos", &inner.pending_pull_intos.len())
            .field("close_requested", &inner.close_requested)
            .field("started", &inner.started)
            .field("pull_state", &inner.pull_state)
            .finish()
    }
}

/// A window onto the buffer of the head pending BYOB read.
///
/// Write into [`ReadableStreamBYOBRequest::view`] and call
/// [`ReadableStreamBYOBRequest::respond`], or supply a replacement view over the same
/// transferred buffer with [`ReadableStreamBYOBRequest::respond_with_new_view`]. The request is
/// invalidated as soon as the controller moves on.
#[derive(Clone)]
pub struct ReadableStreamBYOBRequest(Rc<RefCell<ReadableStreamBYOBRequestInner>>);

struct ReadableStreamBYOBRequestInner {
    controller: Option<ReadableByteStreamController>,
    view: Option<ArrayBufferView>,
}

impl ReadableStreamBYOBRequest {
    pub fn view(&self) -> Option<ArrayBufferView> {
        self.0.borrow().view.clone()
    }

    pub fn respond(&self, bytes_written: usize) -> Result<()> {
        let (controller, view) = {
            let inner = self.0.borrow();
            (inner.controller.clone(), inner.view.clone())
        };

        // If this.[[controller]] is undefined, throw a TypeError exception.
        let (Some(controller), Some(view)) = (controller, view) else {
            return Err(Error::state("This BYOB request has been invalidated"));
        };

        // If ! IsDetachedBuffer(this.[[view]].[[ArrayBuffer]]) is true, throw a TypeError exception.
        if view.buffer().is_detached() {
            return Err(Error::detached("The BYOB request's buffer has been detached"));
        }

        // Assert: this.[[view]].[[ByteLength]] > 0.
        // Assert: this.[[view]].[[ViewedArrayBuffer]].[[ByteLength]] > 0.
        // Perform ? ReadableByteStreamControllerRespond(this.[[controller]], bytesWritten).
        controller.readable_byte_stream_controller_respond(bytes_written)
    }

    pub fn respond_with_new_view(&self, view: ArrayBufferView) -> Result<()> {
        // If this.[[controller]] is undefined, throw a TypeError exception.
        let controller = self
            .0
            .borrow()
            .controller
            .clone()
            .or_throw_state("This BYOB request has been invalidated")?;

        // If ! IsDetachedBuffer(view.[[ViewedArrayBuffer]]) is true, throw a TypeError exception.
        if view.buffer().is_detached() {
            return Err(Error::detached("The given view's buffer has been detached"));
        }

        // Return ? ReadableByteStreamControllerRespondWithNewView(this.[[controller]], view).
        controller.readable_byte_stream_controller_respond_with_new_view(view)
    }
}

impl fmt::Debug for ReadableStreamBYOBRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadableStreamBYOBRequest")
            .field("view", &self.0.borrow().view)
            .finish()
    }
}
