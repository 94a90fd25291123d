//! On-disk encoding for coins
//!
//! Keys are `b'C' ‖ txid ‖ index` with a big-endian index, so that a
//! lexicographic scan visits outputs in `(txid, index)` order. Values start
//! with a format version byte followed by VarInt fields:
//!
//! ```text
//! [version][varint height*2 + coinbase][varint amount][varint len][script]
//! ```

use crate::core::{Coin, OutPoint};
use crate::crypto::Hash256;
use crate::storage::StorageError;

// =============================================================================
// Constants
// =============================================================================

/// Key prefix for coin records
pub const COIN_PREFIX: u8 = b'C';

/// Key holding the hash of the block the stored set corresponds to
pub const BEST_BLOCK_KEY: &[u8] = b"B";

/// Current value encoding version
pub const COIN_FORMAT_VERSION: u8 = 1;

/// Length of an encoded coin key
pub const COIN_KEY_LEN: usize = 1 + 32 + 4;

// =============================================================================
// VarInt
// =============================================================================

/// Append `n` as a VarInt (MSB base-128, each continuation byte offset by one
/// so every value has exactly one encoding)
pub fn write_varint(out: &mut Vec<u8>, mut n: u64) {
    let mut tmp = [0u8; 10];
    let mut len = 0;
    loop {
        tmp[len] = (n & 0x7f) as u8 | if len > 0 { 0x80 } else { 0x00 };
        if n <= 0x7f {
            break;
        }
        n = (n >> 7) - 1;
        len += 1;
    }
    out.extend(tmp[..=len].iter().rev());
}

/// Cursor over an encoded byte slice
pub struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn read_u8(&mut self) -> Result<u8, StorageError> {
        let byte = *self
            .data
            .get(self.pos)
            .ok_or_else(|| StorageError::Decode("unexpected end of data".to_string()))?;
        self.pos += 1;
        Ok(byte)
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], StorageError> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.data.len())
            .ok_or_else(|| {
                StorageError::Decode(format!(
                    "need {} bytes at offset {}, have {}",
                    len,
                    self.pos,
                    self.data.len() - self.pos
                ))
            })?;
        let bytes = &self.data[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    pub fn read_varint(&mut self) -> Result<u64, StorageError> {
        let mut n: u64 = 0;
        loop {
            let byte = self.read_u8()?;
            if n > (u64::MAX >> 7) {
                return Err(StorageError::Decode("varint overflow".to_string()));
            }
            n = (n << 7) | u64::from(byte & 0x7f);
            if byte & 0x80 == 0 {
                return Ok(n);
            }
            n = n
                .checked_add(1)
                .ok_or_else(|| StorageError::Decode("varint overflow".to_string()))?;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.pos == self.data.len()
    }
}

// =============================================================================
// Keys
// =============================================================================

/// Encode the storage key for an outpoint
pub fn encode_key(outpoint: &OutPoint) -> [u8; COIN_KEY_LEN] {
    let mut key = [0u8; COIN_KEY_LEN];
    key[0] = COIN_PREFIX;
    key[1..33].copy_from_slice(outpoint.txid.as_bytes());
    key[33..].copy_from_slice(&outpoint.index.to_be_bytes());
    key
}

/// Decode a coin key back into its outpoint
pub fn decode_key(key: &[u8]) -> Result<OutPoint, StorageError> {
    if key.len() != COIN_KEY_LEN || key[0] != COIN_PREFIX {
        return Err(StorageError::Decode(format!(
            "not a coin key: {}",
            hex::encode(key)
        )));
    }
    let txid = Hash256::from_slice(&key[1..33])
        .map_err(|e| StorageError::Decode(e.to_string()))?;
    let mut index = [0u8; 4];
    index.copy_from_slice(&key[33..]);
    Ok(OutPoint::new(txid, u32::from_be_bytes(index)))
}

// =============================================================================
// Values
// =============================================================================

/// Encode a coin as a versioned storage value
pub fn encode_coin(coin: &Coin) -> Vec<u8> {
    let mut out = Vec::with_capacity(16 + coin.script.len());
    out.push(COIN_FORMAT_VERSION);
    write_varint(
        &mut out,
        u64::from(coin.height) * 2 + u64::from(coin.is_coinbase),
    );
    write_varint(&mut out, coin.amount as u64);
    write_varint(&mut out, coin.script.len() as u64);
    out.extend_from_slice(&coin.script);
    out
}

/// Decode a storage value into a coin
pub fn decode_coin(value: &[u8]) -> Result<Coin, StorageError> {
    let mut reader = Reader::new(value);

    let version = reader.read_u8()?;
    if version != COIN_FORMAT_VERSION {
        return Err(StorageError::Decode(format!(
            "unsupported coin format version {}",
            version
        )));
    }

    let code = reader.read_varint()?;
    let height = u32::try_from(code >> 1)
        .map_err(|_| StorageError::Decode(format!("height out of range: {}", code >> 1)))?;
    let is_coinbase = code & 1 == 1;
    let amount = reader.read_varint()? as i64;
    let script_len = usize::try_from(reader.read_varint()?)
        .map_err(|_| StorageError::Decode("script length out of range".to_string()))?;
    let script = reader.read_bytes(script_len)?.to_vec();

    if !reader.is_empty() {
        return Err(StorageError::Decode("trailing bytes after coin".to_string()));
    }

    Ok(Coin {
        amount,
        script,
        height,
        is_coinbase,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::double_sha256;

    fn varint_bytes(n: u64) -> Vec<u8> {
        let mut out = Vec::new();
        write_varint(&mut out, n);
        out
    }

    #[test]
    fn test_varint_known_encodings() {
        assert_eq!(varint_bytes(0), vec![0x00]);
        assert_eq!(varint_bytes(0x7f), vec![0x7f]);
        assert_eq!(varint_bytes(0x80), vec![0x80, 0x00]);
        assert_eq!(varint_bytes(0x407f), vec![0xff, 0x7f]);
        assert_eq!(varint_bytes(0x4080), vec![0x80, 0x80, 0x00]);
    }

    #[test]
    fn test_varint_extremes() {
        for n in [0, 1, 127, 128, 16_511, 16_512, u32::MAX as u64, u64::MAX] {
            let bytes = varint_bytes(n);
            let mut reader = Reader::new(&bytes);
            assert_eq!(reader.read_varint().unwrap(), n);
            assert!(reader.is_empty());
        }
    }

    #[test]
    fn test_varint_overflow_rejected() {
        let bytes = [0xff; 11];
        assert!(Reader::new(&bytes).read_varint().is_err());
    }

    #[test]
    fn test_key_order_matches_outpoint_order() {
        let txid = double_sha256(b"tx");
        let a = encode_key(&OutPoint::new(txid, 1));
        let b = encode_key(&OutPoint::new(txid, 256));
        assert!(a < b);

        assert_eq!(decode_key(&b).unwrap(), OutPoint::new(txid, 256));
        assert!(decode_key(BEST_BLOCK_KEY).is_err());
    }

    #[test]
    fn test_coin_encoding() {
        let coin = Coin::new(5000, vec![0x76, 0xa9, 0x14], 100, true);
        let encoded = encode_coin(&coin);

        assert_eq!(encoded[0], COIN_FORMAT_VERSION);
        assert_eq!(decode_coin(&encoded).unwrap(), coin);
    }

    #[test]
    fn test_coin_decode_rejects_bad_data() {
        let coin = Coin::new(1, vec![0x51; 10], 5, false);
        let mut encoded = encode_coin(&coin);

        // Unknown version
        let mut wrong_version = encoded.clone();
        wrong_version[0] = 9;
        assert!(matches!(
            decode_coin(&wrong_version),
            Err(StorageError::Decode(_))
        ));

        // Truncated script
        let truncated = &encoded[..encoded.len() - 3];
        assert!(decode_coin(truncated).is_err());

        // Trailing garbage
        encoded.push(0);
        assert!(decode_coin(&encoded).is_err());

        assert!(decode_coin(&[]).is_err());
    }
}
