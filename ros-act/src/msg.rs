//! Wire codec boundary: serde-based message types encoded as CDR.

use serde::{Deserialize, Serialize};
use std::marker::PhantomData;

use crate::Result;

/// Wall-clock timestamp with the fixed two-field wire layout.
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Stamp {
    pub sec: u32,
    pub nsec: u32,
}

impl Stamp {
    pub fn now() -> Self {
        let elapsed = std::time::SystemTime::now()
            .duration_since(std::time::SystemTime::UNIX_EPOCH)
            .unwrap_or_default();
        Self {
            sec: elapsed.as_secs() as u32,
            nsec: elapsed.subsec_nanos(),
        }
    }

    pub fn is_zero(&self) -> bool {
        self.sec == 0 && self.nsec == 0
    }
}

impl std::fmt::Display for Stamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{:09}", self.sec, self.nsec)
    }
}

/// A message that can cross the transport boundary.
///
/// The type name is the stable wire identity used by the
/// [`TypeRegistry`](crate::registry::TypeRegistry) and for per-topic type
/// pinning in the transport.
pub trait WireMessage: Serialize + for<'de> Deserialize<'de> + Send + Sync + 'static {
    fn type_name() -> String;
}

/// CDR codec (little-endian, with encapsulation header) for any serde type.
pub struct CdrCodec<T>(PhantomData<T>);

impl<T: Serialize> CdrCodec<T> {
    pub fn encode(msg: &T) -> Result<Vec<u8>> {
        Ok(cdr::serialize::<_, _, cdr::CdrLe>(msg, cdr::Infinite)?)
    }
}

impl<T: for<'de> Deserialize<'de>> CdrCodec<T> {
    pub fn decode(bytes: &[u8]) -> Result<T> {
        Ok(cdr::deserialize::<T>(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Sample {
        count: u32,
        label: String,
    }

    #[test]
    fn test_cdr_round_trip() {
        let msg = Sample {
            count: 7,
            label: "fixture".to_string(),
        };
        let bytes = CdrCodec::<Sample>::encode(&msg).unwrap();
        let decoded = CdrCodec::<Sample>::decode(&bytes).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(CdrCodec::<Sample>::decode(&[0xFF, 0x01]).is_err());
    }

    #[test]
    fn test_stamp_ordering() {
        let earlier = Stamp { sec: 10, nsec: 5 };
        let later = Stamp { sec: 10, nsec: 6 };
        assert!(earlier < later);
        assert!(Stamp::default().is_zero());
        assert!(!Stamp::now().is_zero());
    }
}
