//! Mapper file cipher
//!
//! Decryption runs three passes over the buffer: a 16-byte block
//! transposition (a trailing partial block is left as is), a swap of
//! mirrored odd/even byte pairs, then XOR with a repeating key. Each pass
//! is a bijection, so encryption runs their inverses in reverse order.

const KEY: &[u8] = b"GeneratePackageMapper\0";

const BLOCK: usize = 16;

/// `plain[b + i] = cipher[b + TABLE[i]]`
const TABLE: [usize; BLOCK] = [12, 6, 9, 4, 3, 14, 1, 10, 13, 2, 7, 15, 0, 8, 5, 11];

pub fn decrypt(data: &[u8]) -> Vec<u8> {
    let mut buf = data.to_vec();
    unshuffle(&mut buf);
    swap_pass(&mut buf);
    xor(&mut buf);
    buf
}

pub fn encrypt(data: &[u8]) -> Vec<u8> {
    let mut buf = data.to_vec();
    xor(&mut buf);
    swap_pass(&mut buf);
    shuffle(&mut buf);
    buf
}

fn unshuffle(buf: &mut [u8]) {
    for block in buf.chunks_exact_mut(BLOCK) {
        let src: [u8; BLOCK] = copy_block(block);
        for (i, &from) in TABLE.iter().enumerate() {
            block[i] = src[from];
        }
    }
}

fn shuffle(buf: &mut [u8]) {
    for block in buf.chunks_exact_mut(BLOCK) {
        let src: [u8; BLOCK] = copy_block(block);
        for (i, &to) in TABLE.iter().enumerate() {
            block[to] = src[i];
        }
    }
}

fn copy_block(block: &[u8]) -> [u8; BLOCK] {
    let mut out = [0u8; BLOCK];
    out.copy_from_slice(block);
    out
}

/// Swaps disjoint pairs, so it is its own inverse
fn swap_pass(buf: &mut [u8]) {
    let len = buf.len();
    if len < 2 {
        return;
    }
    let rounds = (len / 2 + 1) / 2;
    let (mut a, mut b) = (1usize, len - 1);
    for _ in 0..rounds {
        if a >= b {
            break;
        }
        buf.swap(a, b);
        a += 2;
        b -= 2;
    }
}

fn xor(buf: &mut [u8]) {
    for (byte, key) in buf.iter_mut().zip(KEY.iter().cycle()) {
        *byte ^= key;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_is_a_permutation() {
        let mut seen = [false; BLOCK];
        for &i in &TABLE {
            assert!(!seen[i]);
            seen[i] = true;
        }
    }

    #[test]
    fn test_round_trip_odd_lengths() {
        for len in [0usize, 1, 2, 3, 15, 16, 17, 31, 33, 100] {
            let data: Vec<u8> = (0..len).map(|i| (i * 7 + 3) as u8).collect();
            assert_eq!(decrypt(&encrypt(&data)), data, "len {}", len);
            assert_eq!(encrypt(&decrypt(&data)), data, "len {}", len);
        }
    }

    #[test]
    fn test_xor_only_for_short_input() {
        // Below one block only the swap and XOR passes apply
        let plain = b"a,b|";
        let cipher = encrypt(plain);
        let mut expected = plain.to_vec();
        xor(&mut expected);
        swap_pass(&mut expected);
        assert_eq!(cipher, expected);
    }

    #[test]
    fn test_block_transposition() {
        let block: Vec<u8> = (0..16).collect();
        let mut buf = block.clone();
        unshuffle(&mut buf);
        assert_eq!(buf[0], 12);
        assert_eq!(buf[1], 6);
        shuffle(&mut buf);
        assert_eq!(buf, block);
    }
}
