//! Device kinds and symbolic address resolution.
//!
//! A device is a named memory location inside the controller, written as a
//! one- or two-letter prefix followed by a decimal index (`M900`, `D200`,
//! `SM12`). This module turns such names into typed [`DeviceAddress`]
//! records and rejects anything the controller could not address.
//!
//! # Device Kinds
//!
//! | Prefix | Description | Width | Max index |
//! |--------|-------------|-------|----------:|
//! | X | Input | bit | 8191 |
//! | Y | Output | bit | 8191 |
//! | M | Internal relay | bit | 10239 |
//! | L | Latch relay | bit | 511 |
//! | F | Annunciator | bit | 127 |
//! | B | Link relay | bit | 8191 |
//! | SB | Special link relay | bit | 511 |
//! | SM | Special relay | bit | 127 |
//! | D | Data register | word | 8191 |
//! | R | File register | word | 8191 |
//! | W | Link register | word | 8191 |
//! | SW | Special link register | word | 511 |
//! | SD | Special register | word | 127 |
//!
//! # Example
//!
//! ```
//! use m700_nc::{resolve, AccessWidth, DeviceKind};
//!
//! let addr = resolve("M900").unwrap();
//! assert_eq!(addr.kind(), DeviceKind::M);
//! assert_eq!(addr.index(), 900);
//! assert_eq!(addr.width(), AccessWidth::Bit);
//! assert_eq!(addr.to_string(), "M900");
//!
//! assert!(resolve("M99999").is_err());
//! ```

use std::str::FromStr;

use crate::error::{NcError, Result};

/// Access width of a device address.
///
/// The discriminants match the data-type codes the controller uses in
/// device requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum AccessWidth {
    /// Single bit.
    Bit = 1,
    /// 16-bit word.
    Word = 4,
    /// 32-bit doubleword (two consecutive words).
    DoubleWord = 8,
}

impl AccessWidth {
    /// Returns the wire code for this width.
    pub(crate) fn code(self) -> u8 {
        self as u8
    }

    #[cfg(test)]
    pub(crate) fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(AccessWidth::Bit),
            4 => Some(AccessWidth::Word),
            8 => Some(AccessWidth::DoubleWord),
            _ => None,
        }
    }

    /// Number of word slots covered by one access.
    pub(crate) fn words(self) -> u32 {
        match self {
            AccessWidth::Bit | AccessWidth::Word => 1,
            AccessWidth::DoubleWord => 2,
        }
    }
}

impl std::fmt::Display for AccessWidth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AccessWidth::Bit => write!(f, "bit"),
            AccessWidth::Word => write!(f, "word"),
            AccessWidth::DoubleWord => write!(f, "doubleword"),
        }
    }
}

/// Device kinds addressable on the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum DeviceKind {
    /// Input.
    X,
    /// Output.
    Y,
    /// Internal relay.
    M,
    /// Latch relay.
    L,
    /// Annunciator.
    F,
    /// Link relay.
    B,
    /// Special link relay.
    SB,
    /// Special relay.
    SM,
    /// Data register.
    D,
    /// File register.
    R,
    /// Link register.
    W,
    /// Special link register.
    SW,
    /// Special register.
    SD,
}

impl DeviceKind {
    /// All kinds, in wire-code order.
    pub const ALL: [DeviceKind; 13] = [
        DeviceKind::X,
        DeviceKind::Y,
        DeviceKind::M,
        DeviceKind::L,
        DeviceKind::F,
        DeviceKind::B,
        DeviceKind::SB,
        DeviceKind::SM,
        DeviceKind::D,
        DeviceKind::R,
        DeviceKind::W,
        DeviceKind::SW,
        DeviceKind::SD,
    ];

    /// Returns the symbolic prefix of this kind.
    pub fn prefix(self) -> &'static str {
        match self {
            DeviceKind::X => "X",
            DeviceKind::Y => "Y",
            DeviceKind::M => "M",
            DeviceKind::L => "L",
            DeviceKind::F => "F",
            DeviceKind::B => "B",
            DeviceKind::SB => "SB",
            DeviceKind::SM => "SM",
            DeviceKind::D => "D",
            DeviceKind::R => "R",
            DeviceKind::W => "W",
            DeviceKind::SW => "SW",
            DeviceKind::SD => "SD",
        }
    }

    /// Looks up a kind by its exact prefix.
    pub fn from_prefix(prefix: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.prefix() == prefix)
    }

    /// Returns the highest addressable index.
    pub fn max_index(self) -> u32 {
        match self {
            DeviceKind::M => 10239,
            DeviceKind::X | DeviceKind::Y | DeviceKind::B => 8191,
            DeviceKind::D | DeviceKind::R | DeviceKind::W => 8191,
            DeviceKind::L | DeviceKind::SB | DeviceKind::SW => 511,
            DeviceKind::F | DeviceKind::SM | DeviceKind::SD => 127,
        }
    }

    /// Returns whether this kind is bit-addressed.
    ///
    /// # Example
    ///
    /// ```
    /// use m700_nc::DeviceKind;
    ///
    /// assert!(DeviceKind::M.is_bit_device());
    /// assert!(!DeviceKind::D.is_bit_device());
    /// ```
    pub fn is_bit_device(self) -> bool {
        matches!(
            self,
            DeviceKind::X
                | DeviceKind::Y
                | DeviceKind::M
                | DeviceKind::L
                | DeviceKind::F
                | DeviceKind::B
                | DeviceKind::SB
                | DeviceKind::SM
        )
    }

    /// Width used when a name is resolved without an explicit width.
    pub fn default_width(self) -> AccessWidth {
        if self.is_bit_device() {
            AccessWidth::Bit
        } else {
            AccessWidth::Word
        }
    }

    /// Returns whether `width` is a legal access width for this kind.
    pub fn supports_width(self, width: AccessWidth) -> bool {
        match width {
            AccessWidth::Bit => self.is_bit_device(),
            AccessWidth::Word | AccessWidth::DoubleWord => !self.is_bit_device(),
        }
    }

    pub(crate) fn code(self) -> u8 {
        Self::ALL
            .iter()
            .position(|kind| *kind == self)
            .map_or(0, |pos| pos as u8 + 1)
    }

    #[cfg(test)]
    pub(crate) fn from_code(code: u8) -> Option<Self> {
        Self::ALL.get(usize::from(code).checked_sub(1)?).copied()
    }
}

impl std::fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.prefix())
    }
}

/// A resolved, validated device address.
///
/// Constructed by [`resolve`] (or [`str::parse`]); immutable afterwards.
/// [`with_width`](DeviceAddress::with_width) returns a new address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(try_from = "RawDeviceAddress"))]
pub struct DeviceAddress {
    kind: DeviceKind,
    index: u32,
    width: AccessWidth,
}

/// Serialized form of a [`DeviceAddress`], checked on conversion.
#[cfg(feature = "serde")]
#[derive(serde::Deserialize)]
struct RawDeviceAddress {
    kind: DeviceKind,
    index: u32,
    width: AccessWidth,
}

#[cfg(feature = "serde")]
impl TryFrom<RawDeviceAddress> for DeviceAddress {
    type Error = NcError;

    fn try_from(raw: RawDeviceAddress) -> Result<Self> {
        Self::new(raw.kind, raw.index)?.with_width(raw.width)
    }
}

impl DeviceAddress {
    /// Creates an address with the kind's default width.
    ///
    /// # Errors
    ///
    /// Returns `NcError::InvalidAddress` if `index` exceeds the kind's range.
    pub fn new(kind: DeviceKind, index: u32) -> Result<Self> {
        if index > kind.max_index() {
            return Err(NcError::invalid_address(
                format!("{}{}", kind, index),
                format!("index exceeds {}", kind.max_index()),
            ));
        }
        Ok(Self {
            kind,
            index,
            width: kind.default_width(),
        })
    }

    /// Returns the same location accessed with a different width.
    ///
    /// # Errors
    ///
    /// Returns `NcError::InvalidAddress` if the kind does not support the
    /// width, or a doubleword would run past the end of the range.
    ///
    /// # Example
    ///
    /// ```
    /// use m700_nc::{resolve, AccessWidth};
    ///
    /// let dword = resolve("D200").unwrap().with_width(AccessWidth::DoubleWord).unwrap();
    /// assert_eq!(dword.width(), AccessWidth::DoubleWord);
    ///
    /// assert!(resolve("M900").unwrap().with_width(AccessWidth::Word).is_err());
    /// assert!(resolve("D8191").unwrap().with_width(AccessWidth::DoubleWord).is_err());
    /// ```
    pub fn with_width(self, width: AccessWidth) -> Result<Self> {
        if !self.kind.supports_width(width) {
            return Err(NcError::invalid_address(
                self.to_string(),
                format!("{} devices do not support {} access", self.kind, width),
            ));
        }
        self.check_span(width.words())?;
        Ok(Self { width, ..self })
    }

    /// Verifies that `words` consecutive slots starting here are addressable.
    pub(crate) fn check_span(&self, words: u32) -> Result<()> {
        let last = u64::from(self.index) + u64::from(words.max(1)) - 1;
        if last > u64::from(self.kind.max_index()) {
            return Err(NcError::invalid_address(
                self.to_string(),
                format!(
                    "{} word(s) from index {} run past {}",
                    words,
                    self.index,
                    self.kind.max_index()
                ),
            ));
        }
        Ok(())
    }

    /// Returns the device kind.
    pub fn kind(&self) -> DeviceKind {
        self.kind
    }

    /// Returns the device index.
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Returns the access width.
    pub fn width(&self) -> AccessWidth {
        self.width
    }

    /// Serializes the address to 6 bytes (kind, index LE, width).
    pub(crate) fn to_bytes(self) -> [u8; 6] {
        let index = self.index.to_le_bytes();
        [
            self.kind.code(),
            index[0],
            index[1],
            index[2],
            index[3],
            self.width.code(),
        ]
    }

    /// Parses the 6-byte wire form produced by `to_bytes`.
    #[cfg(test)]
    pub(crate) fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let [kind, i0, i1, i2, i3, width] = bytes else {
            return Err(NcError::protocol("device address must be 6 bytes"));
        };
        let kind = DeviceKind::from_code(*kind)
            .ok_or_else(|| NcError::protocol(format!("unknown device code {}", kind)))?;
        let width = AccessWidth::from_code(*width)
            .ok_or_else(|| NcError::protocol(format!("unknown width code {}", width)))?;
        Self::new(kind, u32::from_le_bytes([*i0, *i1, *i2, *i3]))?.with_width(width)
    }
}

impl std::fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}", self.kind, self.index)
    }
}

impl FromStr for DeviceAddress {
    type Err = NcError;

    fn from_str(s: &str) -> Result<Self> {
        resolve(s)
    }
}

/// Parses a symbolic device name into a [`DeviceAddress`].
///
/// The prefix is case-sensitive and the index is plain decimal without
/// sign or leading zeros, so the address always prints back as `name`.
///
/// # Errors
///
/// Returns `NcError::InvalidAddress` when the prefix is unknown, the index
/// is missing, non-numeric or has leading zeros, or the index is out of
/// range for the kind.
///
/// # Example
///
/// ```
/// use m700_nc::resolve;
///
/// assert_eq!(resolve("SM12").unwrap().to_string(), "SM12");
/// assert!(resolve("Q10").is_err());
/// assert!(resolve("D").is_err());
/// assert!(resolve("D0x10").is_err());
/// ```
pub fn resolve(name: &str) -> Result<DeviceAddress> {
    let split = name
        .find(|c: char| !c.is_ascii_uppercase())
        .unwrap_or(name.len());
    let (prefix, digits) = name.split_at(split);

    if prefix.is_empty() || prefix.len() > 2 {
        return Err(NcError::invalid_address(
            name,
            "expected a one- or two-letter device prefix",
        ));
    }
    let kind = DeviceKind::from_prefix(prefix).ok_or_else(|| {
        NcError::invalid_address(name, format!("unknown device prefix '{}'", prefix))
    })?;

    if digits.is_empty() {
        return Err(NcError::invalid_address(name, "missing device index"));
    }
    if !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(NcError::invalid_address(
            name,
            format!("index '{}' is not a decimal number", digits),
        ));
    }
    if digits.len() > 1 && digits.starts_with('0') {
        return Err(NcError::invalid_address(
            name,
            "leading zeros are not allowed",
        ));
    }

    // Anything that overflows u32 is out of range for every kind.
    let index: u32 = digits.parse().map_err(|_| {
        NcError::invalid_address(name, format!("index exceeds {}", kind.max_index()))
    })?;

    DeviceAddress::new(kind, index).map_err(|_| {
        NcError::invalid_address(name, format!("index exceeds {}", kind.max_index()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_resolve_bit_device() {
        let addr = resolve("M900").unwrap();
        assert_eq!(addr.kind(), DeviceKind::M);
        assert_eq!(addr.index(), 900);
        assert_eq!(addr.width(), AccessWidth::Bit);
    }

    #[test]
    fn test_resolve_word_device() {
        let addr = resolve("D200").unwrap();
        assert_eq!(addr.kind(), DeviceKind::D);
        assert_eq!(addr.width(), AccessWidth::Word);
    }

    #[test]
    fn test_resolve_two_letter_prefix() {
        assert_eq!(resolve("SB5").unwrap().kind(), DeviceKind::SB);
        assert_eq!(resolve("SW0").unwrap().kind(), DeviceKind::SW);
        assert_eq!(resolve("SD127").unwrap().kind(), DeviceKind::SD);
    }

    #[test]
    fn test_resolve_out_of_range() {
        let err = resolve("M99999").unwrap_err();
        match err {
            NcError::InvalidAddress { address, reason } => {
                assert_eq!(address, "M99999");
                assert_eq!(reason, "index exceeds 10239");
            }
            other => panic!("Expected InvalidAddress, got {:?}", other),
        }
        assert!(resolve("M10240").is_err());
        assert!(resolve("M10239").is_ok());
        assert!(resolve("D99999999999").is_err());
    }

    #[test]
    fn test_resolve_rejects_malformed() {
        for name in ["", "900", "m900", "Q1", "SMX1", "ABC1", "D", "D-1", "D1.5", "D 1", "D01"] {
            assert!(
                matches!(resolve(name), Err(NcError::InvalidAddress { .. })),
                "{name} should be rejected"
            );
        }
    }

    #[test]
    fn test_zero_index() {
        assert_eq!(resolve("D0").unwrap().index(), 0);
    }

    #[test]
    fn test_with_width() {
        let addr = resolve("D100").unwrap();
        assert_eq!(
            addr.with_width(AccessWidth::DoubleWord).unwrap().width(),
            AccessWidth::DoubleWord
        );
        assert!(addr.with_width(AccessWidth::Bit).is_err());
        assert!(resolve("D8190")
            .unwrap()
            .with_width(AccessWidth::DoubleWord)
            .is_ok());
        assert!(resolve("D8191")
            .unwrap()
            .with_width(AccessWidth::DoubleWord)
            .is_err());
    }

    #[test]
    fn test_kind_codes_roundtrip() {
        for kind in DeviceKind::ALL {
            assert_eq!(DeviceKind::from_code(kind.code()), Some(kind));
        }
        assert_eq!(DeviceKind::from_code(0), None);
        assert_eq!(DeviceKind::from_code(14), None);
    }

    #[test]
    fn test_address_to_bytes() {
        let bytes = resolve("D200").unwrap().to_bytes();
        assert_eq!(bytes, [9, 0xC8, 0x00, 0x00, 0x00, 4]);
    }

    proptest! {
        #[test]
        fn test_resolve_reconstructs_name(
            kind in proptest::sample::select(DeviceKind::ALL.to_vec()),
            seed in any::<u32>(),
        ) {
            let index = seed % (kind.max_index() + 1);
            let name = format!("{}{}", kind.prefix(), index);
            let addr = resolve(&name).unwrap();
            prop_assert_eq!(addr.kind(), kind);
            prop_assert_eq!(addr.index(), index);
            prop_assert_eq!(addr.to_string(), name);
        }

        #[test]
        fn test_resolve_rejects_beyond_range(
            kind in proptest::sample::select(DeviceKind::ALL.to_vec()),
            excess in 1u32..1_000_000,
        ) {
            let name = format!("{}{}", kind.prefix(), kind.max_index() + excess);
            let rejected = matches!(resolve(&name), Err(NcError::InvalidAddress { .. }));
            prop_assert!(rejected);
        }
    }

    #[cfg(feature = "serde")]
    #[test]
    fn test_deserialize_checks_range_and_width() {
        let ok: DeviceAddress =
            serde_json::from_str(r#"{"kind":"D","index":200,"width":"DoubleWord"}"#).unwrap();
        assert_eq!(ok, resolve("D200").unwrap().with_width(AccessWidth::DoubleWord).unwrap());

        assert!(serde_json::from_str::<DeviceAddress>(r#"{"kind":"D","index":8191,"width":"DoubleWord"}"#).is_err());
        assert!(serde_json::from_str::<DeviceAddress>(r#"{"kind":"M","index":4000000,"width":"Bit"}"#).is_err());
        assert!(serde_json::from_str::<DeviceAddress>(r#"{"kind":"M","index":900,"width":"Word"}"#).is_err());
    }
}
