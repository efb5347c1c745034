// Read-only snapshot of what the host reports about an attached device.

pub const USB_DIR_IN: u8 = 0x80;

pub const XFER_CONTROL: u8 = 0;
pub const XFER_ISOC: u8 = 1;
pub const XFER_BULK: u8 = 2;
pub const XFER_INT: u8 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    In,
    Out,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointDescriptor {
    pub address: u8,
    pub direction: Direction,
    pub transfer_type: u8,
    pub attributes: u8,
    pub max_packet_size: u16,
}

impl EndpointDescriptor {
    /// Builds an endpoint from the raw `bEndpointAddress` / `bmAttributes` pair.
    pub fn new(address: u8, attributes: u8, max_packet_size: u16) -> Self {
        let direction = if address & USB_DIR_IN != 0 {
            Direction::In
        } else {
            Direction::Out
        };

        Self {
            address,
            direction,
            transfer_type: attributes & 0x03,
            attributes,
            max_packet_size,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceDescriptor {
    pub number: u8,
    pub alternate_setting: u8,
    pub class: u8,
    pub subclass: u8,
    pub endpoints: Vec<EndpointDescriptor>,
}

impl InterfaceDescriptor {
    pub fn new(number: u8, class: u8, subclass: u8, endpoints: Vec<EndpointDescriptor>) -> Self {
        Self {
            number,
            alternate_setting: 0,
            class,
            subclass,
            endpoints,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescriptor {
    pub id: String,
    pub vendor_id: u16,
    pub product_id: u16,
    pub interfaces: Vec<InterfaceDescriptor>,
}

impl DeviceDescriptor {
    pub fn new(id: impl Into<String>, interfaces: Vec<InterfaceDescriptor>) -> Self {
        Self {
            id: id.into(),
            vendor_id: 0,
            product_id: 0,
            interfaces,
        }
    }

    pub fn interface_count(&self) -> usize {
        self.interfaces.len()
    }
}
