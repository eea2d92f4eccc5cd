// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
use std::{cell::RefCell, fmt, rc::Rc};

use crate::{
    error::{Error, Result},
    result::ResultExt,
};

/// Shared byte storage.
///
/// Every clone refers to the same storage. [`ArrayBuffer::transfer`] moves the bytes into a
/// fresh handle and leaves every existing handle detached, so at most one live owner of the
/// bytes exists after a transfer.
#[derive(Clone, Default)]
pub struct ArrayBuffer(Rc<RefCell<Option<Vec<u8>>>>);

impl ArrayBuffer {
    pub fn new(byte_length: usize) -> Self {
        Self::from_vec(vec![0; byte_length])
    }

    pub fn from_vec(bytes: Vec<u8>) -> Self {
        Self(Rc::new(RefCell::new(Some(bytes))))
    }

    pub fn byte_length(&self) -> usize {
        self.0.borrow().as_ref().map(Vec::len).unwrap_or(0)
    }

    pub fn is_detached(&self) -> bool {
        self.0.borrow().is_none()
    }

    /// Moves the storage into a new handle, detaching this one and all of its clones.
    pub fn transfer(self) -> Result<ArrayBuffer> {
        let bytes = self
            .0
            .borrow_mut()
            .take()
            .or_throw_detached("Cannot transfer a detached ArrayBuffer")?;
        Ok(Self::from_vec(bytes))
    }

    /// Copies `byte_length` bytes starting at `byte_offset` into independent storage.
    pub fn duplicate(&self, byte_offset: usize, byte_length: usize) -> Result<ArrayBuffer> {
        self.with_bytes(|bytes| {
            bytes
                .get(byte_offset..byte_offset + byte_length)
                .map(|slice| Self::from_vec(slice.to_vec()))
                .or_throw_validation("Cannot duplicate beyond the end of the buffer")
        })?
    }

    pub fn with_bytes<R>(&self, f: impl FnOnce(&[u8]) -> R) -> Result<R> {
        let bytes = self.0.borrow();
        let bytes = bytes
            .as_ref()
            .or_throw_detached("ArrayBuffer is detached")?;
        Ok(f(bytes))
    }

    pub fn with_bytes_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> Result<R> {
        let mut bytes = self.0.borrow_mut();
        let bytes = bytes
            .as_mut()
            .or_throw_detached("ArrayBuffer is detached")?;
        Ok(f(bytes))
    }

    pub fn ptr_eq(&self, other: &ArrayBuffer) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for ArrayBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &*self.0.borrow() {
            Some(bytes) => write!(f, "ArrayBuffer({} bytes)", bytes.len()),
            None => f.write_str("ArrayBuffer(detached)"),
        }
    }
}

/// Copies `count` bytes between two buffers, which may be the same storage.
pub fn copy_data_block_bytes(
    to: &ArrayBuffer,
    to_index: usize,
    from: &ArrayBuffer,
    from_index: usize,
    count: usize,
) -> Result<()> {
    if to.ptr_eq(from) {
        return to.with_bytes_mut(|bytes| {
            bytes.copy_within(from_index..from_index + count, to_index);
        });
    }
    from.with_bytes(|src| {
        to.with_bytes_mut(|dst| {
            dst[to_index..to_index + count].copy_from_slice(&src[from_index..from_index + count]);
        })
    })?
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ViewKind {
    Int8,
    Uint8,
    Uint8Clamped,
    Int16,
    Uint16,
    Int32,
    Uint32,
    Float32,
    Float64,
    BigInt64,
    BigUint64,
    DataView,
}

impl ViewKind {
    pub fn element_size(self) -> usize {
        match self {
            ViewKind::Int8 | ViewKind::Uint8 | ViewKind::Uint8Clamped | ViewKind::DataView => 1,
            ViewKind::Int16 | ViewKind::Uint16 => 2,
            ViewKind::Int32 | ViewKind::Uint32 | ViewKind::Float32 => 4,
            ViewKind::Float64 | ViewKind::BigInt64 | ViewKind::BigUint64 => 8,
        }
    }
}

/// A typed window over an [`ArrayBuffer`].
#[derive(Clone)]
pub struct ArrayBufferView {
    buffer: ArrayBuffer,
    byte_offset: usize,
    byte_length: usize,
    kind: ViewKind,
}

impl ArrayBufferView {
    /// Creates a view of `length` elements of `kind` starting at `byte_offset`.
    pub fn new(
        kind: ViewKind,
        buffer: ArrayBuffer,
        byte_offset: usize,
        length: usize,
    ) -> Result<Self> {
        let element_size = kind.element_size();
        if byte_offset % element_size != 0 {
            return Err(Error::validation(format!(
                "Start offset of {kind:?} should be a multiple of {element_size}"
            )));
        }
        let byte_length = length * element_size;
        if byte_offset + byte_length > buffer.byte_length() {
            return Err(Error::validation(format!(
                "Invalid {kind:?} length {length} for a buffer of {} bytes",
                buffer.byte_length()
            )));
        }
        Ok(Self {
            buffer,
            byte_offset,
            byte_length,
            kind,
        })
    }

    /// A fresh zero-filled view of `length` elements.
    pub fn with_length(kind: ViewKind, length: usize) -> Self {
        Self {
            buffer: ArrayBuffer::new(length * kind.element_size()),
            byte_offset: 0,
            byte_length: length * kind.element_size(),
            kind,
        }
    }

    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        let bytes = bytes.into();
        let byte_length = bytes.len();
        Self {
            buffer: ArrayBuffer::from_vec(bytes),
            byte_offset: 0,
            byte_length,
            kind: ViewKind::Uint8,
        }
    }

    pub fn buffer(&self) -> &ArrayBuffer {
        &self.buffer
    }

    pub fn byte_offset(&self) -> usize {
        if self.buffer.is_detached() {
            0
        } else {
            self.byte_offset
        }
    }

    pub fn byte_length(&self) -> usize {
        if self.buffer.is_detached() {
            0
        } else {
            self.byte_length
        }
    }

    pub fn kind(&self) -> ViewKind {
        self.kind
    }

    pub fn element_size(&self) -> usize {
        self.kind.element_size()
    }

    /// Number of elements, zero once the buffer is detached.
    pub fn length(&self) -> usize {
        self.byte_length() / self.element_size()
    }

    pub fn to_vec(&self) -> Result<Vec<u8>> {
        self.buffer
            .with_bytes(|bytes| bytes[self.byte_offset..self.byte_offset + self.byte_length].to_vec())
    }
}

impl fmt::Debug for ArrayBufferView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArrayBufferView")
            .field("kind", &self.kind)
            .field("byte_offset", &self.byte_offset)
            .field("byte_length", &self.byte_length)
            .field("detached", &self.buffer.is_detached())
            .finish()
    }
}

impl PartialEq for ArrayBufferView {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind
            && match (self.to_vec(), other.to_vec()) {
                (Ok(a), Ok(b)) => a == b,
                (Err(_), Err(_)) => true,
                _ => false,
            }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transfer_detaches_every_clone() {
        let buffer = ArrayBuffer::from_vec(vec![1, 2, 3]);
        let alias = buffer.clone();
        let view = ArrayBufferView::new(ViewKind::Uint8, buffer.clone(), 0, 3).unwrap();

        let moved = buffer.transfer().unwrap();

        assert!(alias.is_detached());
        assert_eq!(view.byte_length(), 0);
        assert_eq!(view.length(), 0);
        assert!(view.to_vec().unwrap_err().is_buffer_ownership());
        assert_eq!(moved.with_bytes(|b| b.to_vec()).unwrap(), vec![1, 2, 3]);
        assert!(alias.transfer().unwrap_err().is_buffer_ownership());
    }

    #[test]
    fn duplicate_is_independent() {
        let buffer = ArrayBuffer::from_vec(vec![1, 2, 3, 4]);
        let copy = buffer.duplicate(1, 2).unwrap();
        buffer.with_bytes_mut(|b| b[1] = 9).unwrap();
        assert_eq!(copy.with_bytes(|b| b.to_vec()).unwrap(), vec![2, 3]);
        assert!(buffer.duplicate(3, 2).unwrap_err().is_validation());
    }

    #[test]
    fn view_bounds_and_alignment() {
        let buffer = ArrayBuffer::new(8);
        assert!(ArrayBufferView::new(ViewKind::Uint16, buffer.clone(), 1, 1)
            .unwrap_err()
            .is_validation());
        assert!(ArrayBufferView::new(ViewKind::Uint32, buffer.clone(), 4, 2)
            .unwrap_err()
            .is_validation());
        let view = ArrayBufferView::new(ViewKind::Uint32, buffer, 4, 1).unwrap();
        assert_eq!(view.byte_length(), 4);
        assert_eq!(view.element_size(), 4);
    }

    #[test]
    fn copies_within_the_same_buffer() {
        let buffer = ArrayBuffer::from_vec(vec![1, 2, 3, 4]);
        copy_data_block_bytes(&buffer, 0, &buffer, 2, 2).unwrap();
        assert_eq!(buffer.with_bytes(|b| b.to_vec()).unwrap(), vec![3, 4, 3, 4]);
    }
}
