//! Contains the main type model: emitter identity (spec §3).
//!
//! Wi-Fi and Bluetooth emitters are keyed by [`mac_address::MacAddress`],
//! whose equality and ordering give us case/separator-insensitive
//! comparison (spec §8 property 4) once a value is constructed. Its
//! `FromStr`, however, only accepts colon- or hyphen-delimited octets — it
//! does not parse the bare 12-hex-digit form spec §6 also requires
//! (`^[0-9a-fA-F]{12}$`) — so [`parse_mac`] below decodes the hex bytes
//! directly instead of going through `FromStr`.

use mac_address::MacAddress;
use serde::Deserialize;

/// Parses either MAC spelling spec §6 allows: bare 12 hex digits
/// (`"50ff20ec90d7"`) or colon/hyphen-delimited octets
/// (`"50:FF:20:EC:90:D7"`). Strips any non-hex characters first, so both
/// forms (and mixed-case input) land on the same six bytes, then builds
/// the address directly from those bytes rather than relying on
/// [`MacAddress`]'s stricter `FromStr`, which rejects the separator-free
/// form outright.
pub fn parse_mac(raw: &str) -> Option<MacAddress> {
    let hex: String = raw.chars().filter(|c| c.is_ascii_hexdigit()).collect();
    if hex.len() != 12 {
        return None;
    }
    let mut bytes = [0u8; 6];
    for (i, byte) in bytes.iter_mut().enumerate() {
        *byte = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16).ok()?;
    }
    Some(MacAddress::new(bytes))
}

/// Cell radio family (spec §3). Values match the historical MLS/Ichnaea
/// encoding so the imported coarse dataset and learned aggregates agree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, sqlx::Type, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
#[repr(i16)]
pub enum CellRadio {
    Gsm = 2,
    Wcdma = 3,
    Lte = 4,
    Nr = 5,
}

/// The six-tuple cell identity from spec §3: `(radio, country, network,
/// area, cell, unit)`. All integers are stored signed in Postgres, matching
/// the teacher's `model.rs` comment; callers clamp MCC/MNC into `[1, 999]`
/// before constructing one (spec §4.4 step 4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CellKey {
    pub radio: CellRadio,
    pub country: i16,
    pub network: i16,
    pub area: i32,
    pub cell: i64,
    pub unit: i16,
}

/// Identity of one of the three disjoint emitter kinds described in spec §3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EmitterKey {
    Wifi(MacAddress),
    Bluetooth(MacAddress),
    Cell(CellKey),
}

impl EmitterKey {
    pub fn kind(&self) -> EmitterKind {
        match self {
            EmitterKey::Wifi(_) => EmitterKind::Wifi,
            EmitterKey::Bluetooth(_) => EmitterKind::Bluetooth,
            EmitterKey::Cell(_) => EmitterKind::Cell,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmitterKind {
    Wifi,
    Bluetooth,
    Cell,
}

/// Clamp MCC/MNC into `[1, 999]` per spec §4.4 step 4.
pub fn clamp_mcc_mnc(x: i32) -> i16 {
    x.clamp(1, 999) as i16
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_mac_accepts_bare_hex() {
        assert!(parse_mac("5ca6e669e5ec").is_some());
    }

    #[test]
    fn parse_mac_accepts_colon_delimited() {
        assert!(parse_mac("5C:A6:E6:69:E5:EC").is_some());
    }

    #[test]
    fn parse_mac_bare_and_colon_forms_collide() {
        assert_eq!(parse_mac("50ff20ec90d7"), parse_mac("50:FF:20:EC:90:D7"));
    }

    #[test]
    fn parse_mac_rejects_wrong_length() {
        assert!(parse_mac("50ff20ec90").is_none());
        assert!(parse_mac("50ff20ec90d7ff").is_none());
    }
}
