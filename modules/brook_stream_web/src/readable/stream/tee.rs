use std::{cell::RefCell, mem, rc::Rc};

use brook_utils::{
    ArrayBufferView, Ctx, Error, Promise, ResolveablePromise, Result, Value, ViewKind,
};
use tracing::debug;

use super::{
    algorithms::{CancelAlgorithm, PullAlgorithm, StartAlgorithm},
    ReadableStream,
};
use crate::{
    queuing_strategy::SizeAlgorithm,
    readable::{
        ReadableByteStreamController, ReadableStreamBYOBReader, ReadableStreamController,
        ReadableStreamDefaultController, ReadableStreamDefaultReader,
        ReadableStreamReadIntoRequest, ReadableStreamReadRequest, ReadableStreamReader,
    },
    utils::OperationState,
};

impl ReadableStream {
    /// Splits this stream into two branches that each see every chunk. The stream stays locked
    /// for as long as the branches exist.
    ///
    /// Byte streams produce byte stream branches whose chunks never share storage.
    pub fn tee(&self) -> Result<(ReadableStream, ReadableStream)> {
        // Return ? ReadableStreamTee(this, false).
        match self.controller() {
            // If stream.[[controller]] implements ReadableByteStreamController, return ? ReadableByteStreamTee(stream).
            ReadableStreamController::Byte(_) => ByteTee::tee(self),
            // Return ? ReadableStreamDefaultTee(stream, cloneForBranch2).
            ReadableStreamController::Default(_) => DefaultTee::tee(self),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Branch {
    First,
    Second,
}

impl Branch {
    const BOTH: [Branch; 2] = [Branch::First, Branch::Second];

    fn index(self) -> usize {
        match self {
            Branch::First => 0,
            Branch::Second => 1,
        }
    }

    fn other(self) -> Branch {
        match self {
            Branch::First => Branch::Second,
            Branch::Second => Branch::First,
        }
    }
}

/// Cancellation bookkeeping shared by both tee flavors.
#[derive(Default)]
struct Cancellation {
    canceled: [bool; 2],
    reasons: [Value; 2],
}

impl Cancellation {
    fn is_canceled(&self, branch: Branch) -> bool {
        self.canceled[branch.index()]
    }

    fn both_canceled(&self) -> bool {
        self.canceled[0] && self.canceled[1]
    }

    /// Records `reason` for `branch`. Returns the composite reason once both branches are
    /// canceled.
    fn cancel(&mut self, branch: Branch, reason: Value) -> Option<Value> {
        // Set canceled1 to true.
        // Set reason1 to reason.
        self.canceled[branch.index()] = true;
        self.reasons[branch.index()] = reason;

        // If canceled2 is true,
        // Let compositeReason be ! CreateArrayFromList(« reason1, reason2 »).
        self.both_canceled()
            .then(|| Value::from(self.reasons.to_vec()))
    }
}

/// The part of a tee that does not depend on the controller flavor.
struct TeeCore<C> {
    stream: ReadableStream,
    cancellation: RefCell<Cancellation>,
    branches: RefCell<[Option<C>; 2]>,
    cancel_promise: ResolveablePromise<()>,
    ctx: Ctx,
}

impl<C: Clone> TeeCore<C> {
    fn new(stream: &ReadableStream) -> Self {
        let ctx = stream.ctx();
        Self {
            stream: stream.clone(),
            cancellation: RefCell::default(),
            branches: RefCell::new([None, None]),
            // Let cancelPromise be a new promise.
            cancel_promise: ResolveablePromise::new(&ctx),
            ctx,
        }
    }

    fn set_branch(&self, branch: Branch, controller: C) {
        self.branches.borrow_mut()[branch.index()] = Some(controller);
    }

    fn branch(&self, branch: Branch) -> Option<C> {
        self.branches.borrow()[branch.index()].clone()
    }

    /// The controller of `branch` unless that branch was canceled.
    fn live_branch(&self, branch: Branch) -> Option<C> {
        if self.cancellation.borrow().is_canceled(branch) {
            return None;
        }
        self.branch(branch)
    }

    fn is_canceled(&self, branch: Branch) -> bool {
        self.cancellation.borrow().is_canceled(branch)
    }

    fn cancel(&self, branch: Branch, reason: Value) -> Promise<()> {
        let composite_reason = self.cancellation.borrow_mut().cancel(branch, reason);

        if let Some(composite_reason) = composite_reason {
            debug!("Both tee branches cancelled, cancelling source");
            // Let cancelResult be ! ReadableStreamCancel(stream, compositeReason).
            // Resolve cancelPromise with cancelResult.
            self.cancel_source(composite_reason);
        }

        // Return cancelPromise.
        self.cancel_promise.promise.clone()
    }

    fn cancel_source(&self, reason: Value) {
        let cancel_result = self.stream.readable_stream_cancel(reason);
        let cancel_promise = self.cancel_promise.clone();
        cancel_result.react(move |result| cancel_promise.settle_with(result));
    }

    /// Resolves the cancel promise unless both branches were canceled, in which case the
    /// source cancellation settles it.
    fn source_finished(&self) {
        // If canceled1 is false or canceled2 is false, resolve cancelPromise with undefined.
        if !self.cancellation.borrow().both_canceled() {
            self.cancel_promise.resolve_undefined();
        }
    }
}

struct DefaultTee(Rc<DefaultTeeInner>);

struct DefaultTeeInner {
    core: TeeCore<ReadableStreamDefaultController>,
    reader: ReadableStreamDefaultReader,
    reading: RefCell<OperationState>,
}

impl Clone for DefaultTee {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl DefaultTee {
    fn tee(stream: &ReadableStream) -> Result<(ReadableStream, ReadableStream)> {
        // Let reader be ? AcquireReadableStreamDefaultReader(stream).
        let reader = ReadableStreamDefaultReader::set_up_readable_stream_default_reader(stream)?;

        let tee = Self(Rc::new(DefaultTeeInner {
            core: TeeCore::new(stream),
            reader: reader.clone(),
            // Let reading be false.
            // Let readAgain be false.
            reading: RefCell::default(),
        }));

        // Set branch1 to ! CreateReadableStream(startAlgorithm, pullAlgorithm, cancel1Algorithm).
        let branch_1 = tee.create_branch(Branch::First)?;
        // Set branch2 to ! CreateReadableStream(startAlgorithm, pullAlgorithm, cancel2Algorithm).
        let branch_2 = tee.create_branch(Branch::Second)?;

        // Upon rejection of reader.[[closedPromise]] with reason r,
        reader.closed().react(move |result| {
            let Err(reason) = result else {
                return;
            };
            for branch in Branch::BOTH {
                // Perform ! ReadableStreamDefaultControllerError(branch1.[[controller]], r).
                if let Some(controller) = tee.0.core.branch(branch) {
                    controller.readable_stream_default_controller_error(reason.clone());
                }
            }
            tee.0.core.source_finished();
        });

        // Return « branch1, branch2 ».
        Ok((branch_1, branch_2))
    }

    fn create_branch(&self, branch: Branch) -> Result<ReadableStream> {
        let ctx = self.0.core.ctx.clone();

        let start_algorithm = StartAlgorithm::from_fn({
            let tee = self.clone();
            move |controller: ReadableStreamDefaultController| {
                tee.0.core.set_branch(branch, controller);
                Ok(Promise::resolved(&tee.0.core.ctx, ()))
            }
        });

        let pull_algorithm = PullAlgorithm::from_fn({
            let tee = self.clone();
            move |_| {
                tee.pull();
                // Return a promise resolved with undefined.
                Ok(Promise::resolved(&tee.0.core.ctx, ()))
            }
        });

        let cancel_algorithm = CancelAlgorithm::from_fn({
            let tee = self.clone();
            move |reason| Ok(tee.0.core.cancel(branch, reason))
        });

        ReadableStream::create_readable_stream(
            &ctx,
            start_algorithm,
            pull_algorithm,
            cancel_algorithm,
            1.0,
            SizeAlgorithm::AlwaysOne,
        )
    }

    fn pull(&self) {
        // If reading is true, set readAgain to true and return.
        // Set reading to true.
        if !self.0.reading.borrow_mut().begin() {
            return;
        }

        // Perform ! ReadableStreamDefaultReaderRead(reader, readRequest).
        self.0
            .reader
            .readable_stream_default_reader_read(Box::new(DefaultTeeReadRequest {
                tee: self.clone(),
            }));
    }

    fn on_chunk(&self, chunk: Value) {
        // Set readAgain to false.
        *self.0.reading.borrow_mut() = OperationState::InFlight;

        // Let chunk1 and chunk2 be chunk.
        for branch in Branch::BOTH {
            // If canceled1 is false, perform ! ReadableStreamDefaultControllerEnqueue(branch1.[[controller]], chunk1).
            if let Some(controller) = self.0.core.live_branch(branch) {
                if let Err(err) = controller.readable_stream_default_controller_enqueue(chunk.clone())
                {
                    debug!("Tee branch rejected chunk: {}", err);
                }
            }
        }

        // Set reading to false.
        // If readAgain is true, perform pullAlgorithm.
        if self.0.reading.borrow_mut().finish() {
            self.pull();
        }
    }

    fn on_close(&self) {
        // Set reading to false.
        self.0.reading.borrow_mut().finish();

        for branch in Branch::BOTH {
            // If canceled1 is false, perform ! ReadableStreamDefaultControllerClose(branch1.[[controller]]).
            if let Some(controller) = self.0.core.live_branch(branch) {
                controller.readable_stream_default_controller_close();
            }
        }

        self.0.core.source_finished();
    }
}

struct DefaultTeeReadRequest {
    tee: DefaultTee,
}

impl ReadableStreamReadRequest for DefaultTeeReadRequest {
    fn chunk_steps(self: Box<Self>, chunk: Value) {
        let ctx = self.tee.0.core.ctx.clone();
        // Queue a microtask to perform the following steps:
        ctx.enqueue_job(move || self.tee.on_chunk(chunk));
    }

    fn close_steps(self: Box<Self>) {
        self.tee.on_close()
    }

    fn error_steps(self: Box<Self>, _reason: Value) {
        // Set reading to false.
        self.tee.0.reading.borrow_mut().finish();
    }
}

/// Read coalescing for the byte tee, which has to remember which branch asked for a repeat.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
enum ByteTeeReadState {
    #[default]
    Idle,
    Reading {
        read_again_for_branch_1: bool,
        read_again_for_branch_2: bool,
    },
}

impl ByteTeeReadState {
    const FRESH: ByteTeeReadState = ByteTeeReadState::Reading {
        read_again_for_branch_1: false,
        read_again_for_branch_2: false,
    };

    fn begin(&mut self, branch: Branch) -> bool {
        match self {
            ByteTeeReadState::Idle => {
                *self = Self::FRESH;
                true
            },
            ByteTeeReadState::Reading {
                read_again_for_branch_1,
                read_again_for_branch_2,
            } => {
                match branch {
                    Branch::First => *read_again_for_branch_1 = true,
                    Branch::Second => *read_again_for_branch_2 = true,
                }
                false
            },
        }
    }

    fn clear_read_again(&mut self) {
        if *self != ByteTeeReadState::Idle {
            *self = Self::FRESH;
        }
    }

    /// Ends the read and returns the branch to pull for next, the first branch taking
    /// precedence.
    fn finish(&mut self) -> Option<Branch> {
        match mem::take(self) {
            ByteTeeReadState::Reading {
                read_again_for_branch_1: true,
                ..
            } => Some(Branch::First),
            ByteTeeReadState::Reading {
                read_again_for_branch_2: true,
                ..
            } => Some(Branch::Second),
            _ => None,
        }
    }
}

struct ByteTee(Rc<ByteTeeInner>);

struct ByteTeeInner {
    core: TeeCore<ReadableByteStreamController>,
    reader: RefCell<ReadableStreamReader>,
    read_state: RefCell<ByteTeeReadState>,
}

impl Clone for ByteTee {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl ByteTee {
    fn tee(stream: &ReadableStream) -> Result<(ReadableStream, ReadableStream)> {
        // Let reader be ? AcquireReadableStreamDefaultReader(stream).
        let reader = ReadableStreamDefaultReader::set_up_readable_stream_default_reader(stream)?;

        let tee = Self(Rc::new(ByteTeeInner {
            core: TeeCore::new(stream),
            reader: RefCell::new(reader.into()),
            read_state: RefCell::default(),
        }));

        // Set branch1 to ! CreateReadableByteStream(startAlgorithm, pull1Algorithm, cancel1Algorithm).
        let branch_1 = tee.create_branch(Branch::First)?;
        // Set branch2 to ! CreateReadableByteStream(startAlgorithm, pull2Algorithm, cancel2Algorithm).
        let branch_2 = tee.create_branch(Branch::Second)?;

        // Perform forwardReaderError, given reader.
        let reader = tee.0.reader.borrow().clone();
        tee.forward_reader_error(reader);

        // Return « branch1, branch2 ».
        Ok((branch_1, branch_2))
    }

    fn create_branch(&self, branch: Branch) -> Result<ReadableStream> {
        let ctx = self.0.core.ctx.clone();

        let start_algorithm = StartAlgorithm::from_fn({
            let tee = self.clone();
            move |controller: ReadableByteStreamController| {
                tee.0.core.set_branch(branch, controller);
                Ok(Promise::resolved(&tee.0.core.ctx, ()))
            }
        });

        let pull_algorithm = PullAlgorithm::from_fn({
            let tee = self.clone();
            move |_| {
                tee.pull(branch);
                // Return a promise resolved with undefined.
                Ok(Promise::resolved(&tee.0.core.ctx, ()))
            }
        });

        let cancel_algorithm = CancelAlgorithm::from_fn({
            let tee = self.clone();
            move |reason| Ok(tee.0.core.cancel(branch, reason))
        });

        ReadableStream::create_readable_byte_stream(
            &ctx,
            start_algorithm,
            pull_algorithm,
            cancel_algorithm,
            0.0,
            None,
        )
    }

    fn forward_reader_error(&self, this_reader: ReadableStreamReader) {
        let tee = self.clone();
        // Upon rejection of thisReader.[[closedPromise]] with reason r,
        this_reader.closed().react(move |result| {
            let Err(reason) = result else {
                return;
            };

            // If thisReader is not reader, return.
            if !this_reader.ptr_eq(&tee.0.reader.borrow()) {
                return;
            }

            // Perform ! ReadableByteStreamControllerError(branch1.[[controller]], r).
            // Perform ! ReadableByteStreamControllerError(branch2.[[controller]], r).
            tee.error_branches(reason);
            tee.0.core.source_finished();
        });
    }

    fn error_branches(&self, reason: Value) {
        for branch in Branch::BOTH {
            if let Some(controller) = self.0.core.branch(branch) {
                controller.readable_byte_stream_controller_error(reason.clone());
            }
        }
    }

    /// Routing a chunk failed: both branches error and the source is cancelled with the
    /// failure.
    fn fail(&self, err: Error) {
        debug!("Tee failed to route a chunk: {}", err);
        let reason: Value = err.into();
        self.error_branches(reason.clone());
        // Resolve cancelPromise with ! ReadableStreamCancel(stream, cloneResult.[[Value]]).
        self.0.core.cancel_source(reason);
    }

    fn pull(&self, branch: Branch) {
        // If reading is true, set readAgainForBranch1 to true and return.
        // Set reading to true.
        if !self.0.read_state.borrow_mut().begin(branch) {
            return;
        }

        // Let byobRequest be ! ReadableByteStreamControllerGetBYOBRequest(branch1.[[controller]]).
        let view = self
            .0
            .core
            .branch(branch)
            .and_then(|controller| controller.readable_byte_stream_controller_get_byob_request())
            .and_then(|byob_request| byob_request.view());

        match view {
            // If byobRequest is null, perform pullWithDefaultReader.
            None => self.pull_with_default_reader(),
            // Otherwise, perform pullWithBYOBReader, given byobRequest.[[view]] and false.
            Some(view) => self.pull_with_byob_reader(view, branch),
        }
    }

    fn pull_with_default_reader(&self) {
        let current = self.0.reader.borrow().clone();
        let reader = match current {
            ReadableStreamReader::Default(reader) => reader,
            // If reader implements ReadableStreamBYOBReader,
            ReadableStreamReader::Byob(reader) => {
                debug!("Tee switching to a default reader");
                // Perform ! ReadableStreamBYOBReaderRelease(reader).
                reader.readable_stream_byob_reader_release();
                // Set reader to ! AcquireReadableStreamDefaultReader(stream).
                let reader = match ReadableStreamDefaultReader::set_up_readable_stream_default_reader(
                    &self.0.core.stream,
                ) {
                    Ok(reader) => reader,
                    Err(err) => return self.fail(err),
                };
                *self.0.reader.borrow_mut() = reader.clone().into();
                // Perform forwardReaderError, given reader.
                self.forward_reader_error(reader.clone().into());
                reader
            },
        };

        // Perform ! ReadableStreamDefaultReaderRead(reader, readRequest).
        reader.readable_stream_default_reader_read(Box::new(ByteTeeReadRequest {
            tee: self.clone(),
        }));
    }

    fn pull_with_byob_reader(&self, view: ArrayBufferView, for_branch: Branch) {
        let current = self.0.reader.borrow().clone();
        let reader = match current {
            ReadableStreamReader::Byob(reader) => reader,
            // If reader implements ReadableStreamDefaultReader,
            ReadableStreamReader::Default(reader) => {
                debug!("Tee switching to a BYOB reader");
                // Perform ! ReadableStreamDefaultReaderRelease(reader).
                reader.readable_stream_default_reader_release();
                // Set reader to ! AcquireReadableStreamBYOBReader(stream).
                let reader = match ReadableStreamBYOBReader::set_up_readable_stream_byob_reader(
                    &self.0.core.stream,
                ) {
                    Ok(reader) => reader,
                    Err(err) => return self.fail(err),
                };
                *self.0.reader.borrow_mut() = reader.clone().into();
                // Perform forwardReaderError, given reader.
                self.forward_reader_error(reader.clone().into());
                reader
            },
        };

        // Perform ! ReadableStreamBYOBReaderRead(reader, view, 1, readIntoRequest).
        reader.readable_stream_byob_reader_read(
            view,
            1,
            Box::new(ByteTeeReadIntoRequest {
                tee: self.clone(),
                for_branch,
            }),
        );
    }

    fn finish_read(&self) {
        // Set reading to false.
        let next = self.0.read_state.borrow_mut().finish();
        // If readAgainForBranch1 is true, perform pull1Algorithm.
        // Otherwise, if readAgainForBranch2 is true, perform pull2Algorithm.
        if let Some(branch) = next {
            self.pull(branch);
        }
    }

    fn on_default_chunk(&self, chunk: Value) -> Result<()> {
        // Set readAgainForBranch1 to false.
        // Set readAgainForBranch2 to false.
        self.0.read_state.borrow_mut().clear_read_again();

        let Value::Bytes(chunk_1) = chunk else {
            return Err(Error::validation("Byte stream produced a chunk that is not bytes"));
        };

        // Let chunk1 and chunk2 be chunk.
        // If canceled1 is false and canceled2 is false,
        let chunk_2 = if !self.0.core.is_canceled(Branch::First)
            && !self.0.core.is_canceled(Branch::Second)
        {
            // Let cloneResult be CloneAsUint8Array(chunk).
            // Otherwise, set chunk2 to cloneResult.[[Value]].
            clone_as_uint8_array(&chunk_1)?
        } else {
            chunk_1.clone()
        };

        // If canceled1 is false, perform ! ReadableByteStreamControllerEnqueue(branch1.[[controller]], chunk1).
        if let Some(controller) = self.0.core.live_branch(Branch::First) {
            controller.readable_byte_stream_controller_enqueue(chunk_1)?;
        }
        // If canceled2 is false, perform ! ReadableByteStreamControllerEnqueue(branch2.[[controller]], chunk2).
        if let Some(controller) = self.0.core.live_branch(Branch::Second) {
            controller.readable_byte_stream_controller_enqueue(chunk_2)?;
        }

        self.finish_read();
        Ok(())
    }

    fn on_default_close(&self) {
        // Set reading to false.
        *self.0.read_state.borrow_mut() = ByteTeeReadState::Idle;

        for branch in Branch::BOTH {
            // If canceled1 is false, perform ! ReadableByteStreamControllerClose(branch1.[[controller]]).
            if let Some(controller) = self.0.core.live_branch(branch) {
                if let Err(err) = controller.readable_byte_stream_controller_close() {
                    debug!("Tee branch failed to close: {}", err);
                }
            }
        }

        for branch in Branch::BOTH {
            // If branch1.[[controller]].[[pendingPullIntos]] is not empty, perform ! ReadableByteStreamControllerRespond(branch1.[[controller]], 0).
            if let Some(controller) = self.0.core.branch(branch) {
                if controller.has_pending_pull_intos() {
                    if let Err(err) = controller.readable_byte_stream_controller_respond(0) {
                        debug!("Tee branch failed to answer a pending read: {}", err);
                    }
                }
            }
        }

        self.0.core.source_finished();
    }

    fn on_byob_chunk(&self, chunk: ArrayBufferView, byob_branch: Branch) -> Result<()> {
        // Set readAgainForBranch1 to false.
        // Set readAgainForBranch2 to false.
        self.0.read_state.borrow_mut().clear_read_again();

        let other_branch = byob_branch.other();
        // Let byobCanceled be canceled2 if forBranch2 is true, and canceled1 otherwise.
        // Let otherCanceled be canceled2 if forBranch2 is false, and canceled1 otherwise.
        let byob_controller = self.0.core.live_branch(byob_branch);
        let other_controller = self.0.core.live_branch(other_branch);

        match other_controller {
            // If otherCanceled is false,
            Some(other_controller) => {
                // Let cloneResult be CloneAsUint8Array(chunk).
                let cloned_chunk = clone_as_uint8_array(&chunk)?;
                // If byobCanceled is false, perform ! ReadableByteStreamControllerRespondWithNewView(byobBranch.[[controller]], chunk).
                if let Some(byob_controller) = byob_controller {
                    byob_controller.readable_byte_stream_controller_respond_with_new_view(chunk)?;
                }
                // Perform ! ReadableByteStreamControllerEnqueue(otherBranch.[[controller]], clonedChunk).
                other_controller.readable_byte_stream_controller_enqueue(cloned_chunk)?;
            },
            // Otherwise, if byobCanceled is false, perform ! ReadableByteStreamControllerRespondWithNewView(byobBranch.[[controller]], chunk).
            None => {
                if let Some(byob_controller) = byob_controller {
                    byob_controller.readable_byte_stream_controller_respond_with_new_view(chunk)?;
                }
            },
        }

        self.finish_read();
        Ok(())
    }

    fn on_byob_close(&self, chunk: Option<ArrayBufferView>, byob_branch: Branch) {
        // Set reading to false.
        *self.0.read_state.borrow_mut() = ByteTeeReadState::Idle;

        let other_branch = byob_branch.other();
        let byob_controller = self.0.core.live_branch(byob_branch);
        let other_controller = self.0.core.live_branch(other_branch);

        // If byobCanceled is false, perform ! ReadableByteStreamControllerClose(byobBranch.[[controller]]).
        // If otherCanceled is false, perform ! ReadableByteStreamControllerClose(otherBranch.[[controller]]).
        for controller in [&byob_controller, &other_controller].into_iter().flatten() {
            if let Err(err) = controller.readable_byte_stream_controller_close() {
                debug!("Tee branch failed to close: {}", err);
            }
        }

        // If chunk is not undefined,
        if let Some(chunk) = chunk {
            // If byobCanceled is false, perform ! ReadableByteStreamControllerRespondWithNewView(byobBranch.[[controller]], chunk).
            if let Some(controller) = &byob_controller {
                if let Err(err) = controller.readable_byte_stream_controller_respond_with_new_view(chunk)
                {
                    debug!("Tee branch failed to answer a pending read: {}", err);
                }
            }
            // If otherCanceled is false and otherBranch.[[controller]].[[pendingPullIntos]] is not empty, perform ! ReadableByteStreamControllerRespond(otherBranch.[[controller]], 0).
            if let Some(controller) = &other_controller {
                if controller.has_pending_pull_intos() {
                    if let Err(err) = controller.readable_byte_stream_controller_respond(0) {
                        debug!("Tee branch failed to answer a pending read: {}", err);
                    }
                }
            }
        }

        // If byobCanceled is false or otherCanceled is false, resolve cancelPromise with undefined.
        if byob_controller.is_some() || other_controller.is_some() {
            self.0.core.cancel_promise.resolve_undefined();
        }
    }
}

/// Copies the viewed bytes into a fresh `Uint8` view with its own storage.
fn clone_as_uint8_array(chunk: &ArrayBufferView) -> Result<ArrayBufferView> {
    let buffer = chunk
        .buffer()
        .duplicate(chunk.byte_offset(), chunk.byte_length())?;
    ArrayBufferView::new(ViewKind::Uint8, buffer, 0, chunk.byte_length())
}

struct ByteTeeReadRequest {
    tee: ByteTee,
}

impl ReadableStreamReadRequest for ByteTeeReadRequest {
    fn chunk_steps(self: Box<Self>, chunk: Value) {
        let ctx = self.tee.0.core.ctx.clone();
        // Queue a microtask to perform the following steps:
        ctx.enqueue_job(move || {
            if let Err(err) = self.tee.on_default_chunk(chunk) {
                self.tee.fail(err);
            }
        });
    }

    fn close_steps(self: Box<Self>) {
        self.tee.on_default_close()
    }

    fn error_steps(self: Box<Self>, _reason: Value) {
        // Set reading to false.
        *self.tee.0.read_state.borrow_mut() = ByteTeeReadState::Idle;
    }
}

struct ByteTeeReadIntoRequest {
    tee: ByteTee,
    for_branch: Branch,
}

impl ReadableStreamReadIntoRequest for ByteTeeReadIntoRequest {
    fn chunk_steps(self: Box<Self>, chunk: ArrayBufferView) {
        let ctx = self.tee.0.core.ctx.clone();
        // Queue a microtask to perform the following steps:
        ctx.enqueue_job(move || {
            if let Err(err) = self.tee.on_byob_chunk(chunk, self.for_branch) {
                self.tee.fail(err);
            }
        });
    }

    fn close_steps(self: Box<Self>, chunk: Option<ArrayBufferView>) {
        self.tee.on_byob_close(chunk, self.for_branch)
    }

    fn error_steps(self: Box<Self>, _reason: Value) {
        // Set reading to false.
        *self.tee.0.read_state.borrow_mut() = ByteTeeReadState::Idle;
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::RefCell, rc::Rc};

    use brook_test::test_async_with;
    use brook_utils::{ArrayBufferView, Ctx, Promise, Value, ViewKind};

    use super::{Branch, ByteTeeReadState};
    use crate::{
        queuing_strategy::QueuingStrategy,
        readable::{
            ReadableByteStreamController, ReadableStream, ReadableStreamDefaultController,
            ReadableStreamReadResult, ReadableStreamState, UnderlyingByteSource,
            UnderlyingSource,
        },
    };

    #[test]
    fn test_byte_read_state_prefers_first_branch() {
        let mut state = ByteTeeReadState::default();
        assert!(state.begin(Branch::Second));
        assert!(!state.begin(Branch::Second));
        assert!(!state.begin(Branch::First));
        assert_eq!(state.finish(), Some(Branch::First));
        assert_eq!(state, ByteTeeReadState::Idle);

        assert!(state.begin(Branch::First));
        assert!(!state.begin(Branch::Second));
        state.clear_read_again();
        assert_eq!(state.finish(), None);
    }

    #[tokio::test]
    async fn test_both_branches_see_every_chunk() {
        test_async_with(|ctx| {
            Box::pin(async move {
                let stream = ReadableStream::from_iter(&ctx, ["a", "b", "c"]).unwrap();
                let (branch_1, branch_2) = stream.tee().unwrap();
                assert!(stream.locked());
                assert!(stream.tee().unwrap_err().is_state());

                // Draining the first branch buffers the chunks for the second.
                let reader_1 = branch_1.get_reader().unwrap();
                for expected in ["a", "b", "c"] {
                    assert_eq!(
                        ctx.settle(&reader_1.read()).await.unwrap(),
                        ReadableStreamReadResult::chunk(expected.into())
                    );
                }
                assert!(ctx.settle(&reader_1.read()).await.unwrap().done);

                let reader_2 = branch_2.get_reader().unwrap();
                for expected in ["a", "b", "c"] {
                    assert_eq!(
                        ctx.settle(&reader_2.read()).await.unwrap(),
                        ReadableStreamReadResult::chunk(expected.into())
                    );
                }
                assert!(ctx.settle(&reader_2.read()).await.unwrap().done);
            })
        })
        .await;
    }

    #[tokio::test]
    async fn test_cancelling_both_branches_cancels_source_once() {
        test_async_with(|ctx| {
            Box::pin(async move {
                let reasons = Rc::new(RefCell::new(Vec::new()));
                let stream = ReadableStream::new(
                    &ctx,
                    UnderlyingSource::new().with_cancel({
                        let ctx = ctx.clone();
                        let reasons = reasons.clone();
                        move |reason| {
                            reasons.borrow_mut().push(reason);
                            Ok(Promise::resolved(&ctx, ()))
                        }
                    }),
                    QueuingStrategy::default(),
                )
                .unwrap();
                let (branch_1, branch_2) = stream.tee().unwrap();

                let first = branch_1.cancel("r1");
                ctx.execute_pending_jobs();
                assert!(first.is_pending());
                assert!(reasons.borrow().is_empty());

                let second = branch_2.cancel("r2");
                ctx.settle(&first).await.unwrap();
                ctx.settle(&second).await.unwrap();

                assert_eq!(
                    *reasons.borrow(),
                    vec![Value::from(vec![Value::from("r1"), Value::from("r2")])]
                );
                assert_eq!(stream.state(), ReadableStreamState::Closed);
            })
        })
        .await;
    }

    #[tokio::test]
    async fn test_source_error_errors_both_branches() {
        test_async_with(|ctx| {
            Box::pin(async move {
                let controller = Rc::new(RefCell::new(None));
                let stream = ReadableStream::new(
                    &ctx,
                    UnderlyingSource::new().with_start({
                        let ctx = ctx.clone();
                        let controller = controller.clone();
                        move |c: ReadableStreamDefaultController| {
                            controller.replace(Some(c));
                            Ok(Promise::resolved(&ctx, ()))
                        }
                    }),
                    QueuingStrategy::default(),
                )
                .unwrap();
                let (branch_1, branch_2) = stream.tee().unwrap();
                let reader_1 = branch_1.get_reader().unwrap();
                let read = reader_1.read();
                read.set_is_handled();
                ctx.execute_pending_jobs();

                let controller = controller.borrow().clone().unwrap();
                controller.error("boom");

                assert_eq!(ctx.settle(&read).await.unwrap_err(), Value::from("boom"));
                ctx.execute_pending_jobs();
                assert_eq!(branch_2.state(), ReadableStreamState::Errored("boom".into()));
            })
        })
        .await;
    }

    fn byte_source(ctx: &Ctx, chunks: Vec<Vec<u8>>) -> ReadableStream {
        let chunks = Rc::new(RefCell::new(chunks.into_iter()));
        ReadableStream::new_bytes(
            ctx,
            UnderlyingByteSource::new().with_pull({
                let ctx = ctx.clone();
                move |controller: ReadableByteStreamController| {
                    let next = chunks.borrow_mut().next();
                    match next {
                        Some(chunk) => controller.enqueue(ArrayBufferView::from_bytes(chunk))?,
                        None => {
                            controller.close()?;
                            if let Some(request) = controller.byob_request() {
                                request.respond(0)?;
                            }
                        },
                    }
                    Ok(Promise::resolved(&ctx, ()))
                }
            }),
            QueuingStrategy::default(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_byte_tee_branches_own_their_buffers() {
        test_async_with(|ctx| {
            Box::pin(async move {
                let stream = byte_source(&ctx, vec![vec![1, 2, 3]]);
                let (branch_1, branch_2) = stream.tee().unwrap();
                let reader_1 = branch_1.get_reader().unwrap();
                let reader_2 = branch_2.get_reader().unwrap();

                let read_1 = reader_1.read();
                let read_2 = reader_2.read();
                let chunk_1 = ctx.settle(&read_1).await.unwrap().value;
                let chunk_2 = ctx.settle(&read_2).await.unwrap().value;

                let (Value::Bytes(view_1), Value::Bytes(view_2)) = (chunk_1, chunk_2) else {
                    panic!("expected byte chunks");
                };
                assert_eq!(view_1.to_vec().unwrap(), vec![1, 2, 3]);
                assert_eq!(view_2.to_vec().unwrap(), vec![1, 2, 3]);
                assert!(!view_1.buffer().ptr_eq(view_2.buffer()));

                view_1.buffer().with_bytes_mut(|b| b[0] = 9).unwrap();
                assert_eq!(view_2.to_vec().unwrap(), vec![1, 2, 3]);

                assert!(ctx.settle(&reader_1.read()).await.unwrap().done);
                assert!(ctx.settle(&reader_2.read()).await.unwrap().done);
            })
        })
        .await;
    }

    #[tokio::test]
    async fn test_byte_tee_serves_byob_branch() {
        test_async_with(|ctx| {
            Box::pin(async move {
                let stream = byte_source(&ctx, vec![vec![4, 5]]);
                let (branch_1, branch_2) = stream.tee().unwrap();

                let byob = branch_1.get_byob_reader().unwrap();
                let view = ArrayBufferView::with_length(ViewKind::Uint8, 8);
                let read = byob.read(view.clone());
                assert!(view.buffer().is_detached());

                let result = ctx.settle(&read).await.unwrap();
                assert!(!result.done);
                let filled = result.value.unwrap();
                assert_eq!(filled.to_vec().unwrap(), vec![4, 5]);
                assert_eq!(filled.buffer().byte_length(), 8);

                // The sibling branch got its own copy.
                let reader_2 = branch_2.get_reader().unwrap();
                let chunk = ctx.settle(&reader_2.read()).await.unwrap().value;
                assert_eq!(chunk.as_bytes().unwrap().to_vec().unwrap(), vec![4, 5]);

                let done = ctx
                    .settle(&byob.read(ArrayBufferView::with_length(ViewKind::Uint8, 8)))
                    .await
                    .unwrap();
                assert!(done.done);
                assert_eq!(done.value.unwrap().byte_length(), 0);
            })
        })
        .await;
    }
}
