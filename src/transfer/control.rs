/// Size of the setup packet that precedes the data stage of a control transfer.
pub const SETUP_PACKET_SIZE: usize = 8;

/// Transfer direction
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum Direction {
    /// Host to device
    Out = 0,

    /// Device to host
    In = 1,
}

impl Direction {
    /// Get the direction from the MSB of the endpoint address.
    pub fn from_address(addr: u8) -> Direction {
        match addr & 0x80 {
            0 => Direction::Out,
            _ => Direction::In,
        }
    }

    /// Endpoint address `addr` with its MSB set to this direction.
    pub(crate) fn endpoint_address(self, addr: u8) -> u8 {
        match self {
            Direction::Out => addr & 0x7f,
            Direction::In => addr | 0x80,
        }
    }
}

/// Specification defining the request.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum ControlType {
    /// Request defined by the USB standard.
    Standard = 0,

    /// Request defined by the standard USB class specification.
    Class = 1,

    /// Non-standard request.
    Vendor = 2,
}

/// Entity targeted by the request.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum Recipient {
    /// Request made to device as a whole.
    Device = 0,

    /// Request made to specific interface.
    Interface = 1,

    /// Request made to specific endpoint.
    Endpoint = 2,

    /// Other request.
    Other = 3,
}

/// Build the `bmRequestType` field of a setup packet.
pub(crate) fn request_type(
    direction: Direction,
    control_type: ControlType,
    recipient: Recipient,
) -> u8 {
    ((direction as u8) << 7) | ((control_type as u8) << 5) | (recipient as u8)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_type_bits() {
        assert_eq!(
            request_type(Direction::In, ControlType::Standard, Recipient::Device),
            0x80
        );
        assert_eq!(
            request_type(Direction::Out, ControlType::Vendor, Recipient::Interface),
            0x41
        );
        assert_eq!(
            request_type(Direction::In, ControlType::Class, Recipient::Other),
            0xA3
        );
    }

    #[test]
    fn direction_from_address() {
        assert_eq!(Direction::from_address(0x81), Direction::In);
        assert_eq!(Direction::from_address(0x02), Direction::Out);
    }

    #[test]
    fn endpoint_address_direction_bit() {
        assert_eq!(Direction::In.endpoint_address(0x02), 0x82);
        assert_eq!(Direction::In.endpoint_address(0x81), 0x81);
        assert_eq!(Direction::Out.endpoint_address(0x81), 0x01);
        assert_eq!(Direction::Out.endpoint_address(0x02), 0x02);
    }
}
