// SPDX-License-Identifier: MPL-2.0

pub type Result<T> = core::result::Result<T, TransportError>;

/// Errors of the PCIe transport.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TransportError {
    /// A DMA or host allocation failed.
    OutOfMemory,
    /// An MMIO or PCI config-space access failed.
    IoError,
    /// A virtual-to-physical translation failed, or a payload element
    /// violated PRP/SGL placement rules.
    BadAddress,
    /// A completion referenced a tracker with no command in flight.
    ProtocolError,
    /// An admin command returned a non-zero status.
    ControllerError,
}
