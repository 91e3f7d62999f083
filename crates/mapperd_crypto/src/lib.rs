mod digest;
pub use digest::{DIGEST_SIZE, Digest, HEX_DIGEST_SIZE};

mod merkle_tree;
pub use merkle_tree::merkle;
