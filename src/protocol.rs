//! Native protocol version numbering and downgrade negotiation.

use std::fmt;

/// Version of the native wire protocol.
///
/// Two families share the version byte: the base family and a
/// vendor-extended family flagged by a high bit. The low six bits carry the
/// ordinal within the family. Negotiation walks downwards within a family;
/// once the extended family is exhausted it jumps to the top of the base
/// family (see [`ProtocolVersion::downgrade`]).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProtocolVersion(i32);

impl ProtocolVersion {
    const EXTENDED_BIT: i32 = 0x40;
    const ORDINAL_MASK: i32 = 0x3F;

    /// Highest protocol version of the base family supported by the driver.
    pub const HIGHEST_BASE: ProtocolVersion = ProtocolVersion::base(4);

    /// A version in the base family.
    pub const fn base(ordinal: i32) -> Self {
        ProtocolVersion(ordinal & Self::ORDINAL_MASK)
    }

    /// A version in the vendor-extended family.
    pub const fn extended(ordinal: i32) -> Self {
        ProtocolVersion((ordinal & Self::ORDINAL_MASK) | Self::EXTENDED_BIT)
    }

    pub fn is_extended(self) -> bool {
        self.0 & Self::EXTENDED_BIT != 0
    }

    /// Ordinal of the version within its family.
    pub fn ordinal(self) -> i32 {
        self.0 & Self::ORDINAL_MASK
    }

    /// Raw wire code of the version.
    pub fn code(self) -> i32 {
        self.0
    }

    /// The next version to try after the server rejected this one.
    ///
    /// Walks down within the current family; the lowest extended ordinal
    /// falls through to the highest base version. Returns `None` once no
    /// lower version exists, i.e. the base ordinal 1 was rejected.
    pub fn downgrade(self) -> Option<ProtocolVersion> {
        if self.is_extended() {
            if self.ordinal() <= 1 {
                Some(Self::HIGHEST_BASE)
            } else {
                Some(ProtocolVersion(self.0 - 1))
            }
        } else if self.ordinal() <= 1 {
            None
        } else {
            Some(ProtocolVersion(self.0 - 1))
        }
    }
}

impl Default for ProtocolVersion {
    fn default() -> Self {
        Self::HIGHEST_BASE
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_extended() {
            write!(f, "xv{}", self.ordinal())
        } else {
            write!(f, "v{}", self.ordinal())
        }
    }
}
