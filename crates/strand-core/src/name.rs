//! Fixed-capacity fiber name

use core::fmt;

/// Maximum name length in bytes; longer names are truncated at a
/// character boundary
pub const NAME_CAPACITY: usize = 16;

/// Short human label for a fiber
///
/// Stored inline so the control block stays allocation-free.
#[derive(Clone, Copy)]
pub struct FiberName {
    buf: [u8; NAME_CAPACITY],
    len: u8,
}

impl FiberName {
    /// Create a name from a string, truncating to [`NAME_CAPACITY`]
    /// bytes at a character boundary
    pub fn new(name: &str) -> Self {
        let mut len = name.len().min(NAME_CAPACITY);
        while !name.is_char_boundary(len) {
            len -= 1;
        }

        let mut buf = [0u8; NAME_CAPACITY];
        buf[..len].copy_from_slice(&name.as_bytes()[..len]);
        FiberName { buf, len: len as u8 }
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        // Always valid: constructed from a &str cut at a char boundary.
        core::str::from_utf8(&self.buf[..self.len as usize]).unwrap_or("")
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Default for FiberName {
    fn default() -> Self {
        FiberName {
            buf: [0; NAME_CAPACITY],
            len: 0,
        }
    }
}

impl fmt::Display for FiberName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Debug for FiberName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FiberName({:?})", self.as_str())
    }
}

impl From<&str> for FiberName {
    fn from(name: &str) -> Self {
        FiberName::new(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_roundtrip() {
        let name = FiberName::new("worker-7");
        assert_eq!(name.as_str(), "worker-7");
        assert!(!name.is_empty());
    }

    #[test]
    fn test_name_truncation() {
        let name = FiberName::new("a-very-long-fiber-name");
        assert_eq!(name.as_str().len(), NAME_CAPACITY);
        assert_eq!(name.as_str(), "a-very-long-fibe");
    }

    #[test]
    fn test_name_truncates_at_char_boundary() {
        // 15 ASCII bytes followed by a two-byte character; a byte-level
        // cut would split the character.
        let name = FiberName::new("aaaaaaaaaaaaaaaé");
        assert_eq!(name.as_str(), "aaaaaaaaaaaaaaa");
    }

    #[test]
    fn test_empty_name() {
        let name = FiberName::default();
        assert!(name.is_empty());
        assert_eq!(name.as_str(), "");
    }
}
