use byteorder::{ByteOrder, LE};
use lazy_static::lazy_static;

use super::consts::*;
use super::util::plain_name;

lazy_static! {
    static ref CRYPTO_TABLE: [u32; 0x500] = generate_crypto_table();
}

fn generate_crypto_table() -> [u32; 0x500] {
    let mut crypto_table = [0u32; 0x500];
    let mut seed: u32 = 0x0010_0001;

    for i in 0..0x100 {
        for j in 0..5 {
            let index = i + j * 0x100;
            seed = (seed * 125 + 3) % 0x002A_AAAB;
            let t1 = (seed & 0xFFFF) << 0x10;
            seed = (seed * 125 + 3) % 0x002A_AAAB;
            let t2 = seed & 0xFFFF;

            crypto_table[index] = t1 | t2;
        }
    }

    crypto_table
}

// names are hashed case-insensitively, with both slash kinds folded together
fn normalize_byte(byte: u8) -> u8 {
    if byte == b'/' {
        b'\\'
    } else {
        byte.to_ascii_uppercase()
    }
}

pub(crate) fn hash_string(source: &[u8], hash_type: u32) -> u32 {
    let mut seed1: u32 = 0x7FED_7FED;
    let mut seed2: u32 = 0xEEEE_EEEE;

    for byte in source {
        let upper = u32::from(normalize_byte(*byte));

        seed1 = CRYPTO_TABLE[(hash_type + upper) as usize] ^ seed1.wrapping_add(seed2);
        seed2 = upper
            .wrapping_add(seed1)
            .wrapping_add(seed2)
            .wrapping_add(seed2 << 5)
            .wrapping_add(3);
    }

    seed1
}

/// Runs the MPQ stream cipher over `data`.
///
/// Only whole u32 words are touched; trailing bytes of a buffer whose
/// length is not a multiple of four are stored in the clear.
fn crypt_mpq_block(data: &mut [u8], mut key: u32, encrypt: bool) {
    let mut key_secondary: u32 = 0xEEEE_EEEE;

    for word in data.chunks_exact_mut(4) {
        key_secondary =
            key_secondary.wrapping_add(CRYPTO_TABLE[(MPQ_HASH_KEY2_MIX + (key & 0xFF)) as usize]);

        let input = LE::read_u32(word);
        let output = input ^ key.wrapping_add(key_secondary);
        LE::write_u32(word, output);

        let plain = if encrypt { input } else { output };

        key = ((!key << 0x15).wrapping_add(0x1111_1111)) | (key >> 0x0B);
        key_secondary = plain
            .wrapping_add(key_secondary)
            .wrapping_add(key_secondary << 5)
            .wrapping_add(3);
    }
}

pub(crate) fn decrypt_mpq_block(data: &mut [u8], key: u32) {
    crypt_mpq_block(data, key, false)
}

pub(crate) fn encrypt_mpq_block(data: &mut [u8], key: u32) {
    crypt_mpq_block(data, key, true)
}

/// Derives the encryption key of a file from its plain name.
///
/// With `fix_key` the key is additionally bound to the position and size
/// of the file, so two copies of the same name never share a key.
pub(crate) fn calculate_file_key(
    file_name: &str,
    file_offset: u64,
    file_size: u64,
    fix_key: bool,
) -> u32 {
    let plain = plain_name(file_name);
    let mut key = hash_string(plain.as_bytes(), MPQ_HASH_FILE_KEY);

    if fix_key {
        key = key.wrapping_add(file_offset as u32) ^ (file_size as u32);
    }

    key
}
