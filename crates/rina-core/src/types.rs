//! Newtype wrappers for protocol identifier fields.
//!
//! These types prevent accidental mixing of addresses, connection-endpoint
//! ids, QoS class ids, and port ids, which all share the same underlying
//! 32-bit representation on the wire.

use core::fmt;

/// A DIF address identifying an IPC process within its layer.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
#[must_use]
pub struct Address(u32);

impl Address {
    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    /// The raw 32-bit value.
    #[must_use]
    pub const fn value(self) -> u32 {
        self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", self.0)
    }
}

/// A connection-endpoint identifier, unique per endpoint per connection.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
#[must_use]
pub struct CepId(u32);

impl CepId {
    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    /// The raw 32-bit value.
    #[must_use]
    pub const fn value(self) -> u32 {
        self.0
    }
}

impl fmt::Display for CepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for CepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CepId({})", self.0)
    }
}

/// A QoS class selector.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
#[must_use]
pub struct QosId(u32);

impl QosId {
    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    /// The raw 32-bit value.
    #[must_use]
    pub const fn value(self) -> u32 {
        self.0
    }
}

impl fmt::Display for QosId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for QosId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "QosId({})", self.0)
    }
}

/// A port identifier for a layer-management or data flow.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
#[must_use]
pub struct PortId(u32);

impl PortId {
    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    /// The raw 32-bit value.
    #[must_use]
    pub const fn value(self) -> u32 {
        self.0
    }
}

impl fmt::Display for PortId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for PortId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PortId({})", self.0)
    }
}
