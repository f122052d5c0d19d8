//! Layer compression detection.
//!
//! Registries do not guarantee media types or file names that match the
//! actual encoding, so layers are classified by their magic bytes.

use std::fmt;
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;

use bzip2::read::MultiBzDecoder;
use flate2::read::{GzDecoder, MultiGzDecoder};
use xz2::read::XzDecoder;

const GZIP_MAGIC: &[u8] = &[0x1f, 0x8b];
const BZIP2_MAGIC: &[u8] = b"BZh";
const XZ_MAGIC: &[u8] = &[0xfd, 0x37, 0x7a, 0x58, 0x5a, 0x00];

/// Encoding of a layer blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    Gzip,
    Bzip2,
    Xz,
    /// Plain tar
    None,
}

impl Compression {
    /// Classify from the leading bytes of a blob.
    pub fn sniff(head: &[u8]) -> Self {
        if head.starts_with(GZIP_MAGIC) {
            Compression::Gzip
        } else if head.starts_with(XZ_MAGIC) {
            Compression::Xz
        } else if head.starts_with(BZIP2_MAGIC) {
            Compression::Bzip2
        } else {
            Compression::None
        }
    }

    /// Classify a file on disk.
    pub fn detect(path: &Path) -> io::Result<Self> {
        let mut head = [0u8; 6];
        let mut file = File::open(path)?;
        let mut filled = 0;
        while filled < head.len() {
            let n = file.read(&mut head[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        Ok(Self::sniff(&head[..filled]))
    }

    /// Letter for the `tar -x?f` flag, if any.
    pub fn tar_flag(self) -> Option<char> {
        match self {
            Compression::Gzip => Some('z'),
            Compression::Bzip2 => Some('j'),
            Compression::Xz => Some('J'),
            Compression::None => None,
        }
    }

    /// Streaming decoder over `path`.
    ///
    /// `multi_member` makes gzip and bzip2 decoding continue across
    /// concatenated members instead of stopping after the first.
    pub fn open(self, path: &Path, multi_member: bool) -> io::Result<Box<dyn Read>> {
        let file = BufReader::new(File::open(path)?);
        Ok(match (self, multi_member) {
            (Compression::Gzip, false) => Box::new(GzDecoder::new(file)),
            (Compression::Gzip, true) => Box::new(MultiGzDecoder::new(file)),
            (Compression::Bzip2, _) => Box::new(MultiBzDecoder::new(file)),
            (Compression::Xz, _) => Box::new(XzDecoder::new_multi_decoder(file)),
            (Compression::None, _) => Box::new(file),
        })
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Compression::Gzip => "gzip",
            Compression::Bzip2 => "bzip2",
            Compression::Xz => "xz",
            Compression::None => "none",
        })
    }
}
