use aes::cipher::{BlockEncrypt, KeyInit};
use aes::Aes128;

/// Manual AES-128-CFB8 cipher that supports streaming (byte-at-a-time).
/// The protocol keeps cipher state across every read and write for the life
/// of the connection, so each direction owns one of these.
pub struct Cfb8Cipher {
    cipher: Aes128,
    iv: [u8; 16],
}

impl Cfb8Cipher {
    /// In this protocol key == IV == shared secret.
    pub fn new(key: &[u8; 16], iv: &[u8; 16]) -> Self {
        let cipher = Aes128::new(key.into());
        Self { cipher, iv: *iv }
    }

    pub fn encrypt(&mut self, data: &mut [u8]) {
        for byte in data.iter_mut() {
            let mut block = aes::Block::from(self.iv);
            self.cipher.encrypt_block(&mut block);
            *byte ^= block[0];
            // Shift IV left by 1, append ciphertext byte
            self.iv.copy_within(1.., 0);
            self.iv[15] = *byte;
        }
    }

    pub fn decrypt(&mut self, data: &mut [u8]) {
        for byte in data.iter_mut() {
            let mut block = aes::Block::from(self.iv);
            self.cipher.encrypt_block(&mut block);
            let ciphertext = *byte;
            *byte ^= block[0];
            // Shift IV left by 1, append original ciphertext byte
            self.iv.copy_within(1.., 0);
            self.iv[15] = ciphertext;
        }
    }
}

impl std::fmt::Debug for Cfb8Cipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Cfb8Cipher { .. }")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cfb8_cipher_roundtrip() {
        let key = [0x01u8; 16];
        let iv = [0x02u8; 16];

        let mut encryptor = Cfb8Cipher::new(&key, &iv);
        let mut decryptor = Cfb8Cipher::new(&key, &iv);

        let original = b"Hello, Minecraft!".to_vec();
        let mut data = original.clone();

        encryptor.encrypt(&mut data);
        assert_ne!(data, original);

        decryptor.decrypt(&mut data);
        assert_eq!(data, original);
    }

    #[test]
    fn test_stream_state_survives_chunking() {
        let secret = [0x5Au8; 16];
        let original: Vec<u8> = (0..=255u8).collect();

        let mut whole = original.clone();
        Cfb8Cipher::new(&secret, &secret).encrypt(&mut whole);

        let mut chunked = original.clone();
        let mut encryptor = Cfb8Cipher::new(&secret, &secret);
        for chunk in chunked.chunks_mut(7) {
            encryptor.encrypt(chunk);
        }
        assert_eq!(whole, chunked);

        let mut decryptor = Cfb8Cipher::new(&secret, &secret);
        for chunk in chunked.chunks_mut(13) {
            decryptor.decrypt(chunk);
        }
        assert_eq!(chunked, original);
    }
}
