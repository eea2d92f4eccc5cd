use std::collections::VecDeque;

use brook_utils::{Error, Result};

/// QueueWithSizes is present in readable and writable streams and abstracts away certain queue operations
#[derive(Debug)]
pub(crate) struct QueueWithSizes<T> {
    pub queue: VecDeque<ValueWithSize<T>>,
    pub queue_total_size: f64,
}

impl<T> Default for QueueWithSizes<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> QueueWithSizes<T> {
    pub fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            queue_total_size: 0.0,
        }
    }

    pub fn enqueue_value_with_size(&mut self, value: T, size: f64) -> Result<()> {
        // If ! IsNonNegativeNumber(size) is false, throw a RangeError exception.
        // If size is +∞, throw a RangeError exception.
        if !is_non_negative_number(size) || size.is_infinite() {
            return Err(Error::validation(
                "Size must be a finite, non-NaN, non-negative number.",
            ));
        }

        // Append a new value-with-size with value value and size size to container.[[queue]].
        self.queue.push_back(ValueWithSize { value, size });

        // Set container.[[queueTotalSize]] to container.[[queueTotalSize]] + size.
        self.queue_total_size += size;

        Ok(())
    }

    pub fn dequeue_value(&mut self) -> Option<T> {
        // Let valueWithSize be container.[[queue]][0].
        // Remove valueWithSize from container.[[queue]].
        let value_with_size = self.queue.pop_front()?;
        // Set container.[[queueTotalSize]] to container.[[queueTotalSize]] − valueWithSize’s size.
        self.queue_total_size -= value_with_size.size;
        // If container.[[queueTotalSize]] < 0, set container.[[queueTotalSize]] to 0. (This can occur due to rounding errors.)
        if self.queue_total_size < 0.0 {
            self.queue_total_size = 0.0
        }
        Some(value_with_size.value)
    }

    pub fn peek_queue_value(&self) -> Option<&T> {
        self.queue.front().map(|value_with_size| &value_with_size.value)
    }

    pub fn reset_queue(&mut self) {
        // Set container.[[queue]] to a new empty list.
        self.queue.clear();
        // Set container.[[queueTotalSize]] to 0.
        self.queue_total_size = 0.0;
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

#[derive(Debug, Clone)]
pub(crate) struct ValueWithSize<T> {
    pub value: T,
    size: f64,
}

fn is_non_negative_number(number: f64) -> bool {
    // If v is NaN, return false.
    // If v < 0, return false.
    !number.is_nan() && number >= 0.0
}
