//! Device descriptor: identity and capabilities a peer announces once per connection.
//! Encoding is bincode; carried as the value of the `deviceInfo` element in a binary frame.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Upper bound on an encoded descriptor; anything bigger is not a descriptor.
const MAX_DESCRIPTOR_LEN: u64 = 4 * 1024;

/// Controller profile the peer emulates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Profile {
    Micro,
    Standard,
    Extended,
    Watch,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    pub vendor_name: String,
    /// Peripheral is physically attached to the host it connects to.
    pub attached_to_device: bool,
    pub profile: Profile,
    pub supports_motion: bool,
    /// Random per-process token; lets a sink tell two peers with the same vendor name apart.
    pub peer_token: Uuid,
}

impl DeviceDescriptor {
    pub fn new(vendor_name: impl Into<String>, profile: Profile) -> Self {
        Self {
            vendor_name: vendor_name.into(),
            attached_to_device: false,
            profile,
            supports_motion: false,
            peer_token: Uuid::new_v4(),
        }
    }

    pub fn with_motion(mut self, supports_motion: bool) -> Self {
        self.supports_motion = supports_motion;
        self
    }

    pub fn encode(&self) -> Result<Vec<u8>, DescriptorError> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DescriptorError> {
        if bytes.len() as u64 > MAX_DESCRIPTOR_LEN {
            return Err(DescriptorError::TooLarge);
        }
        Ok(bincode::deserialize(bytes)?)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DescriptorError {
    #[error("descriptor codec error: {0}")]
    Codec(#[from] bincode::Error),
    #[error("descriptor too large")]
    TooLarge,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_roundtrip() {
        let d = DeviceDescriptor::new("Acme Pad", Profile::Extended).with_motion(true);
        let bytes = d.encode().unwrap();
        assert_eq!(DeviceDescriptor::decode(&bytes).unwrap(), d);
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(DeviceDescriptor::decode(&[0xff, 0xff, 0xff]).is_err());
        assert!(matches!(
            DeviceDescriptor::decode(&vec![0u8; 5000]),
            Err(DescriptorError::TooLarge)
        ));
    }
}
