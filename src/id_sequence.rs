use parking_lot::Mutex;
use std::{fmt, sync::Arc};

/// A shared monotonic sequence, wrapping back to its start once the
/// optional maximum is reached. Channel numbers skip 0, delivery tags don't.
#[derive(Clone)]
pub(crate) struct IdSequence<T> {
    inner: Arc<Mutex<Inner<T>>>,
}

struct Inner<T> {
    allow_zero: bool,
    max: Option<T>,
    id: T,
}

impl<T: Default + Copy + PartialOrd + From<u8> + std::ops::AddAssign<T>> IdSequence<T> {
    pub(crate) fn new(allow_zero: bool) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                allow_zero,
                max: None,
                id: T::default(),
            })),
        }
    }

    pub(crate) fn set_max(&self, max: T) {
        let mut inner = self.inner.lock();
        inner.max = if max == T::default() { None } else { Some(max) };
    }

    pub(crate) fn current(&self) -> T {
        self.inner.lock().id
    }

    pub(crate) fn next(&self) -> T {
        let mut inner = self.inner.lock();
        inner.id += T::from(1);
        if let Some(max) = inner.max {
            if inner.id > max {
                inner.id = T::default();
                if !inner.allow_zero {
                    inner.id += T::from(1);
                }
            }
        }
        inner.id
    }

    pub(crate) fn reset(&self) {
        self.inner.lock().id = T::default();
    }
}

impl<T: fmt::Debug> fmt::Debug for IdSequence<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdSequence")
            .field("id", &self.inner.lock().id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_starts_at_one() {
        let sequence = IdSequence::<u64>::new(false);
        assert_eq!(sequence.next(), 1);
        assert_eq!(sequence.next(), 2);
        assert_eq!(sequence.current(), 2);
    }

    #[test]
    fn sequence_wraps_at_max_skipping_zero() {
        let sequence = IdSequence::<u16>::new(false);
        sequence.set_max(3);
        assert_eq!(sequence.next(), 1);
        assert_eq!(sequence.next(), 2);
        assert_eq!(sequence.next(), 3);
        assert_eq!(sequence.next(), 1);
    }

    #[test]
    fn reset_restarts_the_sequence() {
        let sequence = IdSequence::<u64>::new(false);
        sequence.next();
        sequence.next();
        sequence.reset();
        assert_eq!(sequence.next(), 1);
    }
}
