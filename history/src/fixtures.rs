use crate::{content::DEFAULT_INLINE_THRESHOLD, B3Digest};
use lazy_static::lazy_static;

pub const HELLOWORLD_CONTENTS: &[u8] = b"Hello World!";
pub const EMPTY_CONTENTS: &[u8] = b"";

lazy_static! {
    pub static ref HELLOWORLD_DIGEST: B3Digest = B3Digest::of(HELLOWORLD_CONTENTS);
    pub static ref EMPTY_DIGEST: B3Digest = B3Digest::of(EMPTY_CONTENTS);

    // 2 bytes
    pub static ref BLOB_A: bytes::Bytes = vec![0x00, 0x01].into();
    pub static ref BLOB_A_DIGEST: B3Digest = B3Digest::of(&BLOB_A);

    // 1MB
    pub static ref BLOB_B: bytes::Bytes = (0..255).collect::<Vec<u8>>().repeat(4 * 1024).into();
    pub static ref BLOB_B_DIGEST: B3Digest = B3Digest::of(&BLOB_B);

    // exactly at, and one past, the default inline threshold
    pub static ref AT_THRESHOLD: bytes::Bytes = vec![0x2a; DEFAULT_INLINE_THRESHOLD].into();
    pub static ref PAST_THRESHOLD: bytes::Bytes = vec![0x2a; DEFAULT_INLINE_THRESHOLD + 1].into();
}
