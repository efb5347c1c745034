use std::fmt;

use log::warn;

use super::descriptor::{
    Direction, EndpointDescriptor, InterfaceDescriptor, XFER_BULK, XFER_CONTROL, XFER_INT,
    XFER_ISOC,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferKind {
    Control,
    Isochronous,
    Bulk,
    Interrupt,
    Unknown(u8),
}

impl fmt::Display for TransferKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferKind::Control => write!(f, "CONTROL"),
            TransferKind::Isochronous => write!(f, "ISOCHRONOUS"),
            TransferKind::Bulk => write!(f, "BULK"),
            TransferKind::Interrupt => write!(f, "INTERRUPT"),
            TransferKind::Unknown(code) => write!(f, "UNKNOWN({})", code),
        }
    }
}

pub fn classify(endpoint: &EndpointDescriptor) -> TransferKind {
    match endpoint.transfer_type {
        XFER_CONTROL => TransferKind::Control,
        XFER_ISOC => TransferKind::Isochronous,
        XFER_BULK => TransferKind::Bulk,
        XFER_INT => TransferKind::Interrupt,
        other => {
            warn!(
                "endpoint {:#04x} reports unknown transfer type {}",
                endpoint.address, other
            );
            TransferKind::Unknown(other)
        }
    }
}

pub fn is_inbound(endpoint: &EndpointDescriptor) -> bool {
    endpoint.direction == Direction::In
}

pub fn describe_interface(index: usize, interface: &InterfaceDescriptor) -> String {
    format!(
        "Interface {}: Class = {}, SubClass = {}",
        index, interface.class, interface.subclass
    )
}

pub fn describe_endpoint(index: usize, endpoint: &EndpointDescriptor) -> String {
    let direction = match endpoint.direction {
        Direction::In => "IN",
        Direction::Out => "OUT",
    };

    format!(
        "Endpoint {}: Address = {:#04x}, Attributes = {:#04x}, Direction = {}, Type = {}",
        index,
        endpoint.address,
        endpoint.attributes,
        direction,
        classify(endpoint)
    )
}
