use crate::AudioError;
use crate::constants::BD_ADDR_LENGTH;
use bt_hci::param::{AddrKind, BdAddr, ConnHandle};

const HEX_DIGITS: [char; 16] = [
    '0', '1', '2', '3', '4', '5', '6', '7', '8', '9', 'A', 'B', 'C', 'D', 'E', 'F',
];

/// LE address type as carried next to a `BD_ADDR`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum AddressType {
    /// Public device address
    #[default]
    Public,
    /// Random (static or resolvable) device address
    Random,
}

impl From<AddressType> for AddrKind {
    fn from(kind: AddressType) -> Self {
        match kind {
            AddressType::Public => AddrKind::PUBLIC,
            AddressType::Random => AddrKind::RANDOM,
        }
    }
}

/// An LE peer address: six address bytes plus the address type.
///
/// Two addresses are equal only when both the bytes and the type match, which is
/// how the registry tells peers apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PeerAddress {
    /// Address bytes, least significant byte first as on the air
    pub bytes: [u8; BD_ADDR_LENGTH],
    /// Public or random
    pub kind: AddressType,
}

impl PeerAddress {
    /// The all-zero public address
    pub const ANY: PeerAddress = PeerAddress::new([0; BD_ADDR_LENGTH]);

    /// Create a new public address from bytes
    #[must_use]
    pub const fn new(bytes: [u8; BD_ADDR_LENGTH]) -> Self {
        Self {
            bytes,
            kind: AddressType::Public,
        }
    }

    /// Create a new random address from bytes
    #[must_use]
    pub const fn random(bytes: [u8; BD_ADDR_LENGTH]) -> Self {
        Self {
            bytes,
            kind: AddressType::Random,
        }
    }

    /// Get the raw address bytes
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; BD_ADDR_LENGTH] {
        &self.bytes
    }

    /// Whether this is the all-zero address
    #[must_use]
    pub fn is_any(&self) -> bool {
        self.bytes == [0; BD_ADDR_LENGTH]
    }

    /// Format the address as a colon-separated hex string, most significant byte first
    #[must_use]
    pub fn format_hex(&self) -> heapless::String<17> {
        let mut result = heapless::String::new();
        for (i, byte) in self.bytes.iter().rev().enumerate() {
            if i > 0 {
                result.push(':').ok();
            }
            result.push(HEX_DIGITS[(byte >> 4) as usize]).ok();
            result.push(HEX_DIGITS[(byte & 0x0F) as usize]).ok();
        }
        result
    }

    /// Parse a public address from a colon-separated hex string, most significant byte first
    ///
    /// # Errors
    /// Returns `AudioError::InvalidArgument` if the string is not exactly 17 characters long
    /// or contains anything other than hex digit pairs separated by colons.
    pub fn from_hex(hex: &str) -> Result<Self, AudioError> {
        if hex.len() != 17 || !hex.chars().all(|c| c.is_ascii_hexdigit() || c == ':') {
            return Err(AudioError::InvalidArgument);
        }

        let mut bytes = [0u8; BD_ADDR_LENGTH];
        for (i, part) in hex.split(':').enumerate() {
            if i >= BD_ADDR_LENGTH || part.len() != 2 {
                return Err(AudioError::InvalidArgument);
            }
            bytes[BD_ADDR_LENGTH - 1 - i] =
                u8::from_str_radix(part, 16).map_err(|_| AudioError::InvalidArgument)?;
        }
        Ok(Self::new(bytes))
    }
}

impl From<[u8; BD_ADDR_LENGTH]> for PeerAddress {
    fn from(bytes: [u8; BD_ADDR_LENGTH]) -> Self {
        Self::new(bytes)
    }
}

impl From<PeerAddress> for BdAddr {
    fn from(addr: PeerAddress) -> Self {
        BdAddr::new(addr.bytes)
    }
}

impl TryFrom<&str> for PeerAddress {
    type Error = AudioError;

    fn try_from(hex: &str) -> Result<Self, Self::Error> {
        PeerAddress::from_hex(hex)
    }
}

impl TryFrom<&[u8]> for PeerAddress {
    type Error = AudioError;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        let bytes: [u8; BD_ADDR_LENGTH] =
            bytes.try_into().map_err(|_| AudioError::InvalidArgument)?;
        Ok(PeerAddress::new(bytes))
    }
}

impl TryFrom<BdAddr> for PeerAddress {
    type Error = AudioError;

    fn try_from(bd_addr: BdAddr) -> Result<Self, Self::Error> {
        bd_addr.raw().try_into()
    }
}

/// A live LE ACL link: the controller's handle plus the peer on the other end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Connection {
    /// HCI connection handle
    pub handle: ConnHandle,
    /// Destination address of the link
    pub peer: PeerAddress,
}

impl Connection {
    /// Create a connection from a raw handle and the peer address
    #[must_use]
    pub fn new(handle: u16, peer: PeerAddress) -> Self {
        Self {
            handle: ConnHandle::new(handle),
            peer,
        }
    }

    /// Raw HCI connection handle
    #[must_use]
    pub fn raw_handle(&self) -> u16 {
        self.handle.raw()
    }
}
