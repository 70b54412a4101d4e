pub mod bucket_page;
pub mod codec;
pub mod directory_page;
pub mod error;
pub mod table;

pub use bucket_page::BucketPage;
pub use codec::FixedCodec;
pub use directory_page::{DirectoryPage, DIRECTORY_ARRAY_SIZE, MAX_GLOBAL_DEPTH};
pub use error::HashIndexError;
pub use table::{DefaultKeyHasher, ExtendibleHashIndex, KeyHasher};
