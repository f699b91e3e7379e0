//! Content identities.
//!
//! An identity is the XXH3-128 digest of the content, rendered as 32 lowercase
//! hex characters behind the algorithm name: `xxh128:3c1b...`. Identical bytes
//! get identical identities regardless of where they are stored.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use xxhash_rust::xxh3::{xxh3_128, Xxh3};

/// Algorithm prefix used for content identities.
pub const CONTENT_ID_PREFIX: &str = "xxh128";

/// Read buffer used while hashing files.
const HASH_READ_BUFFER: usize = 1024 * 1024;

fn format_id(digest: u128) -> String {
    format!("{}:{:032x}", CONTENT_ID_PREFIX, digest)
}

/// Identity of an in-memory byte slice.
///
/// # Arguments
/// * `data` - Content bytes
pub fn content_id_for_bytes(data: &[u8]) -> String {
    format_id(xxh3_128(data))
}

/// Identity of a file's content.
///
/// The file is streamed through the hasher, so media of any size can be
/// identified without loading it.
///
/// # Arguments
/// * `path` - File to identify
///
/// # Errors
/// Returns the I/O error if the file cannot be opened or read.
pub fn content_id_for_file(path: &Path) -> Result<String, std::io::Error> {
    let file: File = File::open(path)?;
    let mut reader: BufReader<File> = BufReader::with_capacity(HASH_READ_BUFFER, file);
    let mut hasher: Xxh3 = Xxh3::new();

    loop {
        let chunk: &[u8] = reader.fill_buf()?;
        if chunk.is_empty() {
            break;
        }
        let consumed: usize = chunk.len();
        hasher.update(chunk);
        reader.consume(consumed);
    }

    Ok(format_id(hasher.digest128()))
}
