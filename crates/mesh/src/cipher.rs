use crate::error::{MeshError, Result};

/// Length every pre-shared discovery key must have.
pub const KEY_LEN: usize = 4;

/// Byte-wise XOR against a fixed key repeated cyclically.
///
/// This keeps presence announcements from being trivially greppable on the
/// wire; it is obfuscation, not cryptography. Applying it twice with the
/// same key restores the input.
#[derive(Debug, Clone)]
pub struct XorCipher {
    key: [u8; KEY_LEN],
}

impl XorCipher {
    pub fn new(key: &[u8]) -> Result<Self> {
        if key.len() != KEY_LEN {
            return Err(MeshError::InvalidKey {
                expected: KEY_LEN,
                actual: key.len(),
            });
        }
        let mut fixed = [0u8; KEY_LEN];
        fixed.copy_from_slice(key);
        Ok(Self { key: fixed })
    }

    pub fn apply(&self, data: &[u8]) -> Vec<u8> {
        data.iter()
            .enumerate()
            .map(|(i, byte)| byte ^ self.key[i % KEY_LEN])
            .collect()
    }
}
