//! AES-128 decryption for packed game archives.

use aes::{
    cipher::{generic_array::GenericArray, BlockDecrypt, KeyInit},
    Aes128,
};
use anyhow::{ensure, Result};

pub const AES_BLOCK_SIZE: usize = 16;

/// Rounds `size` up to a whole number of AES blocks.
#[inline]
pub const fn padded_size(size: usize) -> usize { (size + (AES_BLOCK_SIZE - 1)) & !(AES_BLOCK_SIZE - 1) }

/// [`padded_size`] that yields `None` instead of overflowing.
#[inline]
pub const fn checked_padded_size(size: usize) -> Option<usize> {
    match size.checked_add(AES_BLOCK_SIZE - 1) {
        Some(size) => Some(size & !(AES_BLOCK_SIZE - 1)),
        None => None,
    }
}

/// Decrypts `data` in place, each block on its own.
pub fn decrypt_aes128_ecb(data: &mut [u8], key: &[u8; 16]) -> Result<()> {
    ensure!(data.len() % AES_BLOCK_SIZE == 0, "Data size {} is not block aligned", data.len());
    let cipher = Aes128::new(GenericArray::from_slice(key));
    for block in data.chunks_exact_mut(AES_BLOCK_SIZE) {
        cipher.decrypt_block(GenericArray::from_mut_slice(block));
    }
    Ok(())
}

/// Decrypts `data` in place, chaining each block to the previous ciphertext.
pub fn decrypt_aes128_cbc(data: &mut [u8], key: &[u8; 16], iv: &[u8; 16]) -> Result<()> {
    ensure!(data.len() % AES_BLOCK_SIZE == 0, "Data size {} is not block aligned", data.len());
    let cipher = Aes128::new(GenericArray::from_slice(key));
    let mut previous = *iv;
    for block in data.chunks_exact_mut(AES_BLOCK_SIZE) {
        let mut ciphertext = [0u8; AES_BLOCK_SIZE];
        ciphertext.copy_from_slice(block);
        cipher.decrypt_block(GenericArray::from_mut_slice(block));
        for (b, p) in block.iter_mut().zip(previous) {
            *b ^= p;
        }
        previous = ciphertext;
    }
    Ok(())
}
