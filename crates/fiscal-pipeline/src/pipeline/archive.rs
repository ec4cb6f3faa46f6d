use std::io::{Cursor, Write};

use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, DateTime, ZipWriter};

#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("zip write failed: {0}")]
    Zip(#[from] zip::result::ZipError),
    #[error("zip io failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Zip with stored entries, a fixed timestamp and fixed permissions, written
/// in the given order. Equal inputs always produce equal bytes.
pub fn stored_zip(entries: &[(&str, &[u8])]) -> Result<Vec<u8>, ArchiveError> {
    let options = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Stored)
        .last_modified_time(DateTime::default())
        .unix_permissions(0o644);

    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    for (name, bytes) in entries {
        writer.start_file(*name, options)?;
        writer.write_all(bytes)?;
    }
    Ok(writer.finish()?.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_inputs_produce_equal_archives() {
        let first = stored_zip(&[("a.xml", b"<a/>"), ("b.json", b"{}")]).expect("zip");
        let second = stored_zip(&[("a.xml", b"<a/>"), ("b.json", b"{}")]).expect("zip");
        assert_eq!(first, second);
        assert_eq!(&first[..2], b"PK");
    }

    #[test]
    fn entry_order_is_part_of_the_archive() {
        let first = stored_zip(&[("a", b"1"), ("b", b"2")]).expect("zip");
        let swapped = stored_zip(&[("b", b"2"), ("a", b"1")]).expect("zip");
        assert_ne!(first, swapped);
    }
}
