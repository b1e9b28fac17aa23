//! Host buffer objects

use std::borrow::Cow;

/// Bytes handed to the host.
///
/// An external buffer borrows native memory and must not outlive the scope
/// it was created in; an owned buffer holds a private copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostBuffer<'a> {
    bytes: Cow<'a, [u8]>,
}

impl<'a> HostBuffer<'a> {
    pub(super) fn external(data: &'a [u8]) -> Self {
        Self {
            bytes: Cow::Borrowed(data),
        }
    }

    pub(super) fn owned(data: Vec<u8>) -> Self {
        Self {
            bytes: Cow::Owned(data),
        }
    }

    pub fn is_external(&self) -> bool {
        matches!(self.bytes, Cow::Borrowed(_))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Detach from native memory, copying if needed.
    pub fn into_owned(self) -> HostBuffer<'static> {
        HostBuffer {
            bytes: Cow::Owned(self.bytes.into_owned()),
        }
    }
}

impl AsRef<[u8]> for HostBuffer<'_> {
    fn as_ref(&self) -> &[u8] {
        self.as_bytes()
    }
}
