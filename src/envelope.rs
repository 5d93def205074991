use std::fmt;

/// Opaque payload carrier passed between stages
///
/// An envelope is moved from stage to stage, so each one is consumed exactly
/// once per link.
#[derive(Clone, PartialEq, Eq)]
pub struct Envelope<T> {
    payload: T,
}

impl<T> Envelope<T> {
    /// Wrap a payload
    pub fn new(payload: T) -> Self {
        Self { payload }
    }

    /// Borrow the payload
    pub fn payload(&self) -> &T {
        &self.payload
    }

    /// Mutably borrow the payload
    pub fn payload_mut(&mut self) -> &mut T {
        &mut self.payload
    }

    /// Unwrap the payload
    pub fn into_payload(self) -> T {
        self.payload
    }

    /// Replace the payload with the result of `f`
    pub fn map<U, F>(self, f: F) -> Envelope<U>
    where
        F: FnOnce(T) -> U,
    {
        Envelope::new(f(self.payload))
    }
}

impl<T> From<T> for Envelope<T> {
    fn from(payload: T) -> Self {
        Self::new(payload)
    }
}

impl<T: fmt::Debug> fmt::Debug for Envelope<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Envelope").field(&self.payload).finish()
    }
}

/// Predicate deciding whether a stage processes an envelope
///
/// Envelopes a transform rejects are forwarded downstream untouched, which
/// lets control markers share a queue with data.
pub trait Filter<T>: Send + Sync {
    fn accept(&self, envelope: &Envelope<T>) -> bool;
}

/// Filter that accepts every envelope
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

impl<T> Filter<T> for AcceptAll {
    fn accept(&self, _envelope: &Envelope<T>) -> bool {
        true
    }
}

/// Filter that rejects every envelope
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptNone;

impl<T> Filter<T> for AcceptNone {
    fn accept(&self, _envelope: &Envelope<T>) -> bool {
        false
    }
}

impl<T, F> Filter<T> for F
where
    F: Fn(&Envelope<T>) -> bool + Send + Sync,
{
    fn accept(&self, envelope: &Envelope<T>) -> bool {
        self(envelope)
    }
}
