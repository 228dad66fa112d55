use std::{fmt, str::FromStr};

use enumflags2::{bitflags, BitFlags};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

/// Attribute handle inside the peer's GATT database.
pub type AttrHandle = u16;

/// Connection identifier handed out by the radio stack.
pub type ConnId = u16;

/// 48 bit bluetooth device address, most significant byte first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Address(pub [u8; 6]);

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidAddress(pub String);

impl fmt::Display for InvalidAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid bluetooth address `{}`", self.0)
    }
}

impl std::error::Error for InvalidAddress {}

impl FromStr for Address {
    type Err = InvalidAddress;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut res = [0u8; 6];
        let mut parts = s.split(':');
        for b in res.iter_mut() {
            let part = parts
                .next()
                .filter(|x| x.len() == 2)
                .ok_or_else(|| InvalidAddress(s.to_string()))?;
            *b = u8::from_str_radix(part, 16).map_err(|_| InvalidAddress(s.to_string()))?;
        }
        if parts.next().is_some() {
            return Err(InvalidAddress(s.to_string()));
        }
        Ok(Address(res))
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(de::Error::custom)
    }
}

/// Status code of a completed GAP/GATT operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GattStatus(pub u8);

impl GattStatus {
    pub const OK: GattStatus = GattStatus(0x00);
    /// Generic failure, used when the stack reports an error without a code.
    pub const ERROR: GattStatus = GattStatus(0x85);

    pub fn is_ok(self) -> bool {
        self == Self::OK
    }
}

impl fmt::Display for GattStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:02x}", self.0)
    }
}

/// Inclusive handle range of a discovered service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandleRange {
    pub start: AttrHandle,
    pub end: AttrHandle,
}

impl HandleRange {
    pub fn contains(&self, handle: AttrHandle) -> bool {
        self.start <= handle && handle <= self.end
    }
}

#[bitflags]
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CharProp {
    Broadcast = 0x01,
    Read = 0x02,
    WriteNoRsp = 0x04,
    Write = 0x08,
    Notify = 0x10,
    Indicate = 0x20,
    Auth = 0x40,
    ExtProp = 0x80,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttrKind {
    PrimaryService,
    SecondaryService,
    IncludedService,
    Characteristic,
    Descriptor,
}

/// One entry of the peer's attribute database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DbElement {
    pub kind: AttrKind,
    pub handle: AttrHandle,
    pub uuid: u16,
    #[serde(with = "crate::event::ser_props")]
    pub properties: BitFlags<CharProp>,
}

pub mod ser_props {
    use enumflags2::BitFlags;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    use super::CharProp;

    pub fn serialize<S: Serializer>(flags: &BitFlags<CharProp>, s: S) -> Result<S::Ok, S::Error> {
        let list: Vec<_> = flags.iter().collect();
        list.serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<BitFlags<CharProp>, D::Error> {
        let v = Vec::<CharProp>::deserialize(d)?;
        Ok(v.into_iter().collect())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WriteType {
    WithResponse,
    WithoutResponse,
}

/// Everything the radio stack reports back to the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StackEvent {
    ScanResult {
        peer: Address,
        name: Option<String>,
        rssi: Option<i16>,
    },
    Connected {
        status: GattStatus,
        conn_id: ConnId,
        interface: u16,
        peer: Address,
    },
    Disconnected {
        peer: Address,
        reason: u8,
    },
    ServiceFound {
        uuid: u16,
        range: HandleRange,
    },
    SearchComplete {
        status: GattStatus,
    },
    MtuNegotiated {
        status: GattStatus,
        mtu: u16,
    },
    NotifyRegistered {
        status: GattStatus,
        handle: AttrHandle,
    },
    NotifyReceived {
        handle: AttrHandle,
        value: Vec<u8>,
        is_notify: bool,
    },
    WriteComplete {
        status: GattStatus,
        handle: AttrHandle,
    },
    DescriptorWriteComplete {
        status: GattStatus,
        handle: AttrHandle,
    },
}

const BASE_UUID: u128 = 0x0000_0000_0000_1000_8000_0080_5f9b_34fb;

/// Expand a 16 bit SIG uuid into the full 128 bit form.
pub fn uuid_from_u16(v: u16) -> uuid::Uuid {
    uuid::Uuid::from_u128(BASE_UUID | ((v as u128) << 96))
}

/// The 16 bit form of `uuid` if it is derived from the bluetooth base uuid.
pub fn uuid_to_u16(uuid: uuid::Uuid) -> Option<u16> {
    let v = uuid.as_u128();
    if v & !(0xffff_u128 << 96) == BASE_UUID {
        Some((v >> 96) as u16)
    } else {
        None
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn address_roundtrips_through_text() {
        let addr: Address = "98:da:20:04:43:a4".parse().unwrap();
        assert_eq!(addr, Address([0x98, 0xda, 0x20, 0x04, 0x43, 0xa4]));
        assert_eq!(addr.to_string(), "98:da:20:04:43:a4");
        assert_eq!("98:DA:20:04:43:A4".parse::<Address>().unwrap(), addr);
    }

    #[test]
    fn address_rejects_garbage() {
        assert!("98:da:20:04:43".parse::<Address>().is_err());
        assert!("98:da:20:04:43:a4:00".parse::<Address>().is_err());
        assert!("98:da:20:04:43:zz".parse::<Address>().is_err());
        assert!("98da:20:04:43:a4:0".parse::<Address>().is_err());
    }

    #[test]
    fn short_uuids() {
        let full = uuid_from_u16(0xffe0);
        assert_eq!(full.to_string(), "0000ffe0-0000-1000-8000-00805f9b34fb");
        assert_eq!(uuid_to_u16(full), Some(0xffe0));
        assert_eq!(uuid_to_u16(uuid::Uuid::from_u128(0xFEEDC0DE)), None);
    }

    #[test]
    fn db_element_json() {
        let e = DbElement {
            kind: AttrKind::Characteristic,
            handle: 42,
            uuid: 0xabf2,
            properties: CharProp::Write | CharProp::WriteNoRsp,
        };
        let s = serde_json::to_string(&e).unwrap();
        assert_eq!(serde_json::from_str::<DbElement>(&s).unwrap(), e);
    }
}
