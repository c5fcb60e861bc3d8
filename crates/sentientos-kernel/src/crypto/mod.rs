//! SHA-256 digests and hash-chain primitives.

mod hash;

pub use hash::{
    DIGEST_HEX_LEN, GENESIS_PREV_HASH, HashChainError, chain_hash, is_hex_digest, sha256_hex,
    verify_chain_link, verify_entry_hash,
};
