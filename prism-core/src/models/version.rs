//! Version and cookie types.
//!
//! Everything that needs a monotonic clock uses the ordered pair
//! `(state_version, minor_version)`. State versions are tokens assigned by
//! the replica ingester and compare lexicographically; the minor version
//! advances when the CVR changes without the replica moving.
//!
//! The cookie encoding handed to clients must preserve version order
//! byte-for-byte so clients can compare cookies without parsing them. A
//! minor version of zero is encoded as the bare state version; otherwise the
//! minor version is appended after a `'.'` separator. `'.'` (0x2e) sorts
//! below the `[0-9a-z]` alphabet of state versions, which keeps the prefix
//! case ordered correctly: `"1xz" < "1xz.01" < "1xz2"`.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

const LEXI_ALPHABET: &str = "0123456789abcdefghijklmnopqrstuvwxyz";

#[derive(Error, Debug, PartialEq, Eq, Clone)]
pub enum VersionError {
    #[error("malformed cookie: {0}")]
    BadCookie(String),
    #[error("malformed lexi-encoded number: {0}")]
    BadLexi(String),
}

/// Encodes `n` so that numeric order and byte order coincide.
///
/// The number is written in base 36 and prefixed with a single base-36 digit
/// holding `len - 1`. `0` encodes as `"00"`, `35` as `"0z"`, `36` as `"110"`.
pub fn encode_lexi(n: u64) -> String {
    let mut digits = Vec::new();
    let mut rest = n;
    loop {
        digits.push(LEXI_ALPHABET.as_bytes()[(rest % 36) as usize]);
        rest /= 36;
        if rest == 0 {
            break;
        }
    }
    digits.push(LEXI_ALPHABET.as_bytes()[digits.len() - 1]);
    digits.reverse();
    String::from_utf8(digits).expect("lexi alphabet is ascii")
}

/// Inverse of [`encode_lexi`].
pub fn decode_lexi(s: &str) -> Result<u64, VersionError> {
    let bytes = s.as_bytes();
    if bytes.len() < 2 {
        return Err(VersionError::BadLexi(s.to_string()));
    }
    let digit = |b: u8| -> Result<u64, VersionError> {
        match b {
            b'0'..=b'9' => Ok((b - b'0') as u64),
            b'a'..=b'z' => Ok((b - b'a') as u64 + 10),
            _ => Err(VersionError::BadLexi(s.to_string())),
        }
    };
    let expected_len = digit(bytes[0])? as usize + 1;
    if bytes.len() - 1 != expected_len {
        return Err(VersionError::BadLexi(s.to_string()));
    }
    let mut value: u64 = 0;
    for &b in &bytes[1..] {
        value = value
            .checked_mul(36)
            .and_then(|v| digit(b).ok().map(|d| v + d))
            .ok_or_else(|| VersionError::BadLexi(s.to_string()))?;
    }
    Ok(value)
}

/// The externally ordered version token assigned by the replica ingester.
///
/// Tokens compare as plain strings; the ingester guarantees that later
/// replica states receive lexicographically larger tokens.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StateVersion(String);

impl StateVersion {
    /// The minimum state version, predating any replica delta.
    pub fn min() -> Self {
        StateVersion(encode_lexi(0))
    }

    pub fn from_lexi(n: u64) -> Self {
        StateVersion(encode_lexi(n))
    }

    /// Parses a state version out of a cookie fragment. Only the cookie
    /// alphabet is accepted.
    pub fn parse(s: &str) -> Result<Self, VersionError> {
        if s.is_empty() ||
            !s.bytes()
                .all(|b| b.is_ascii_digit() || b.is_ascii_lowercase())
        {
            return Err(VersionError::BadCookie(s.to_string()));
        }
        Ok(StateVersion(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StateVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for StateVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StateVersion({})", self.0)
    }
}

/// The CVR's two-part version. Total order is `(state_version, minor_version)`.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
pub struct CvrVersion {
    pub state_version: StateVersion,
    pub minor_version: u32,
}

impl CvrVersion {
    /// The version of a CVR that has never been flushed.
    pub fn min() -> Self {
        CvrVersion { state_version: StateVersion::min(), minor_version: 0 }
    }

    /// The version following `self` when the CVR changes without the replica
    /// advancing.
    pub fn bump_minor(&self) -> Self {
        CvrVersion {
            state_version: self.state_version.clone(),
            minor_version: self.minor_version + 1,
        }
    }

    /// The version of a CVR update driven by a replica advancement to
    /// `state`. Moving to a new state version resets the minor version; a
    /// CVR update at the state version the CVR is already on bumps it.
    pub fn advance_to(&self, state: StateVersion) -> Self {
        if state == self.state_version {
            self.bump_minor()
        } else {
            CvrVersion { state_version: state, minor_version: 0 }
        }
    }

    /// Order-preserving opaque encoding handed to clients.
    pub fn to_cookie(&self) -> String {
        if self.minor_version == 0 {
            self.state_version.to_string()
        } else {
            format!("{}.{}", self.state_version, encode_lexi(self.minor_version as u64))
        }
    }

    pub fn from_cookie(cookie: &str) -> Result<Self, VersionError> {
        match cookie.split_once('.') {
            None => Ok(CvrVersion { state_version: StateVersion::parse(cookie)?, minor_version: 0 }),
            Some((state, minor)) => {
                let minor = decode_lexi(minor)
                    .map_err(|_| VersionError::BadCookie(cookie.to_string()))?;
                if minor == 0 {
                    // A zero minor version must be encoded as the bare state
                    // version, otherwise two cookies map to one version.
                    return Err(VersionError::BadCookie(cookie.to_string()));
                }
                Ok(CvrVersion {
                    state_version: StateVersion::parse(state)?,
                    minor_version: u32::try_from(minor)
                        .map_err(|_| VersionError::BadCookie(cookie.to_string()))?,
                })
            }
        }
    }

    /// A null base cookie stands for the minimum version.
    pub fn from_base_cookie(cookie: Option<&str>) -> Result<Self, VersionError> {
        match cookie {
            None => Ok(CvrVersion::min()),
            Some(c) => CvrVersion::from_cookie(c),
        }
    }
}

impl fmt::Display for CvrVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_cookie())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    #[rstest]
    #[case(0, "00")]
    #[case(9, "09")]
    #[case(35, "0z")]
    #[case(36, "110")]
    #[case(46655, "2zzz")]
    fn lexi_round_trip(#[case] n: u64, #[case] encoded: &str) {
        assert_eq!(encode_lexi(n), encoded);
        assert_eq!(decode_lexi(encoded).unwrap(), n);
    }

    #[test]
    fn lexi_order_matches_numeric_order() {
        let mut encoded: Vec<String> = (0..2000)
            .chain([10_000, 50_000, 1 << 40])
            .map(encode_lexi)
            .collect();
        let sorted = encoded.clone();
        encoded.sort();
        assert_eq!(encoded, sorted);
    }

    #[rstest]
    #[case("")]
    #[case("1")]
    #[case("0A")]
    #[case("2zz")]
    fn lexi_rejects_malformed(#[case] s: &str) {
        assert!(decode_lexi(s).is_err());
    }

    fn v(state: &str, minor: u32) -> CvrVersion {
        CvrVersion { state_version: StateVersion::parse(state).unwrap(), minor_version: minor }
    }

    #[test]
    fn cookie_round_trip() {
        for version in [v("00", 0), v("1xz", 0), v("1xz", 1), v("1xz", 36), v("2abc", 7)] {
            let cookie = version.to_cookie();
            assert_eq!(CvrVersion::from_cookie(&cookie).unwrap(), version);
        }
    }

    #[test]
    fn cookie_order_matches_version_order() {
        // Includes the prefix case: "1xz" vs "1xz2" with and without minors.
        let mut versions = vec![
            v("00", 0),
            v("0z", 0),
            v("0z", 1),
            v("0z", 2),
            v("1xz", 0),
            v("1xz", 1),
            v("1xz", 35),
            v("1xz", 36),
            v("1xz2", 0),
            v("1xz2", 1),
            v("2abc", 0),
        ];
        versions.sort();
        let cookies: Vec<String> = versions
            .iter()
            .map(CvrVersion::to_cookie)
            .collect();
        let mut sorted = cookies.clone();
        sorted.sort();
        assert_eq!(cookies, sorted);
    }

    #[rstest]
    #[case("")]
    #[case("1XZ")]
    #[case("1xz.")]
    #[case("1xz.00")]
    #[case(".01")]
    #[case("1xz.01.01")]
    fn cookie_rejects_malformed(#[case] cookie: &str) {
        assert!(CvrVersion::from_cookie(cookie).is_err());
    }

    #[test]
    fn base_cookie_null_is_min() {
        assert_eq!(CvrVersion::from_base_cookie(None).unwrap(), CvrVersion::min());
    }

    #[test]
    fn advance_resets_minor_on_new_state() {
        let current = v("1xz", 3);
        assert_eq!(current.advance_to(StateVersion::parse("1y0").unwrap()), v("1y0", 0));
        assert_eq!(current.advance_to(StateVersion::parse("1xz").unwrap()), v("1xz", 4));
    }
}
