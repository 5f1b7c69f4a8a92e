//! Capability bits negotiated in the cluster configuration exchange.
//!
//! Carried as the value of the `"features"` option, marshalled as
//! `<version>:<hex bits>`.

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Features: u32 {
        /// Peer accepts and serves temporary indexes
        const TEMPORARY_INDEX = 1 << 0;
    }
}

/// Option key under which features are advertised
pub const FEATURES_KEY: &str = "features";

/// Current marshalling version
pub const FEATURES_VERSION: u8 = 1;

impl Features {
    /// Features this build supports
    pub fn supported() -> Self {
        Features::TEMPORARY_INDEX
    }

    pub fn marshal(&self) -> String {
        format!("{}:{:08x}", FEATURES_VERSION, self.bits())
    }

    /// Parse a marshalled feature set.
    ///
    /// Unknown bits are dropped. Malformed values and unknown versions yield
    /// an empty set.
    pub fn unmarshal(value: &str) -> Self {
        let Some((version, bits)) = value.split_once(':') else {
            tracing::warn!(value, "malformed features option");
            return Features::empty();
        };
        match version.parse::<u8>() {
            Ok(FEATURES_VERSION) => {}
            _ => {
                tracing::warn!(version, "unsupported features version");
                return Features::empty();
            }
        }
        match u32::from_str_radix(bits, 16) {
            Ok(bits) => Features::from_bits_truncate(bits),
            Err(_) => {
                tracing::warn!(value, "malformed features bits");
                Features::empty()
            }
        }
    }
}
