/*!
Abstraction over a physical address on the target node.
*/

use std::default::Default;
use std::fmt;
use std::ops;

/**
This type represents a physical address on a remote FireWire node.

It internally holds a `u64` value, of which the FireWire asynchronous
transaction layer can address the low 48 bits per node. The top 16 bits
select the node on the wire and are owned by the transport; [`Address::masked`]
clips them before an address goes out in a transaction.

This type will not handle overflow for 64-bit addresses.
*/
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Address(u64);

/// The 48-bit per-node address space of the asynchronous transaction layer.
pub const NODE_ADDR_MASK: u64 = 0x0000_ffff_ffff_ffff;

/// Constructs an `Address` from a `u32` value.
impl From<u32> for Address {
    fn from(item: u32) -> Self {
        Self(u64::from(item))
    }
}

/// Constructs an `Address` from a `u64` value.
impl From<u64> for Address {
    fn from(item: u64) -> Self {
        Self(item)
    }
}

/// Constructs an `Address` from a `usize` value.
impl From<usize> for Address {
    fn from(item: usize) -> Self {
        Self(item as u64)
    }
}

impl Address {
    /// A address with the value of zero.
    pub const NULL: Address = Address(0);

    /// Returns an address with a value of zero.
    pub const fn null() -> Self {
        Address::NULL
    }

    /// Checks wether the address is zero or not.
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Converts the address into a `u64` value.
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Converts the address into a `usize` value.
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }

    /// Clips the address to the 48-bit node address space.
    pub const fn masked(self) -> Address {
        Address(self.0 & NODE_ADDR_MASK)
    }
}

/// Returns a address with a value of zero.
impl Default for Address {
    fn default() -> Self {
        Self::null()
    }
}

/// Adds a `usize` to a `Address` which results in a `Address`.
impl ops::Add<usize> for Address {
    type Output = Self;

    fn add(self, other: usize) -> Self {
        Self(self.0 + other as u64)
    }
}

/// Adds a `usize` to a `Address`.
impl ops::AddAssign<usize> for Address {
    fn add_assign(&mut self, other: usize) {
        *self = Self(self.0 + other as u64)
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:x}", self.0)
    }
}
impl fmt::LowerHex for Address {
    #[inline(always)]
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:x}", self.0)
    }
}
impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from() {
        assert_eq!(Address::null().is_null(), true);
        assert_eq!(Address::from(1337u64).as_u64(), 1337);
        assert_eq!(Address::from(4321usize).as_usize(), 4321);
    }

    #[test]
    fn test_masked() {
        assert_eq!(
            Address::from(0xffff_0123_4567_89abu64).masked().as_u64(),
            0x0123_4567_89ab
        );
        assert_eq!(Address::from(0x1000u64).masked().as_u64(), 0x1000);
    }

    #[test]
    fn test_ops() {
        assert_eq!((Address::from(10u64) + 5usize).as_u64(), 15);

        let mut a = Address::from(10u64);
        a += 20;
        assert_eq!(a.as_u64(), 30);
    }
}
