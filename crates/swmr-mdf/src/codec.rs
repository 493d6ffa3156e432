//! Encode/decode of the metadata-file header and index records.
//!
//! Layout (all integers little-endian):
//!
//! ```text
//! offset 0             HEADER (48 bytes reserved)
//!   "VHDR"      4      magic
//!   page_size   u32
//!   tick_num    u64
//!   index_off   u64    (= 48 in this cut)
//!   index_len   u64    (= 20 + 16 * N)
//!   checksum    u32    CRC32C over the 32 preceding bytes
//!   zero pad to 48
//! offset 48            INDEX (variable)
//!   "VIDX"      4      magic
//!   tick_num    u64    (must equal header.tick_num)
//!   num_entries u32
//!   entries[N]  each: data_page u32, md_page u32, length u32, chksum u32
//!   checksum    u32    CRC32C over all preceding index bytes
//! ```
//!
//! Any magic, checksum, or tick disagreement decodes as a torn read; the
//! caller retries under its bounded budget.

use swmr_error::{Result, SwmrError};
use swmr_types::{MdPageOffset, PageOffset, PageSize, PublishedEntry, Tick};

pub const MD_HEADER_MAGIC: [u8; 4] = *b"VHDR";
pub const MD_INDEX_MAGIC: [u8; 4] = *b"VIDX";

/// Reserved size of the header record; the index record starts here.
pub const MD_HEADER_SIZE: usize = 48;

/// Checksummed prefix of the header (magic + fields).
const MD_HEADER_BODY_SIZE: usize = 32;

/// On-disk size of one index entry (four u32 fields).
pub const MD_INDEX_ENTRY_SIZE: usize = 16;

/// Fixed part of the index record: magic + tick + count + trailing checksum.
const MD_INDEX_FIXED_SIZE: usize = 20;

/// Encoded size of an index record holding `num_entries` entries.
#[must_use]
pub fn index_record_size(num_entries: u32) -> u64 {
    MD_INDEX_FIXED_SIZE as u64 + u64::from(num_entries) * MD_INDEX_ENTRY_SIZE as u64
}

/// Decoded metadata-file header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MdHeader {
    pub page_size: u32,
    pub tick_num: Tick,
    pub index_offset: u64,
    pub index_length: u64,
}

fn read_le_u32(bytes: &[u8], offset: usize) -> Option<u32> {
    let end = offset.checked_add(4)?;
    bytes
        .get(offset..end)
        .map(|b| u32::from_le_bytes(b.try_into().expect("4-byte slice")))
}

fn read_le_u64(bytes: &[u8], offset: usize) -> Option<u64> {
    let end = offset.checked_add(8)?;
    bytes
        .get(offset..end)
        .map(|b| u64::from_le_bytes(b.try_into().expect("8-byte slice")))
}

fn torn(detail: impl Into<String>) -> SwmrError {
    SwmrError::TornRead {
        detail: detail.into(),
    }
}

/// Encode the header that commits `tick` with `num_entries` index entries.
#[must_use]
pub fn encode_header(tick: Tick, page_size: PageSize, num_entries: u32) -> [u8; MD_HEADER_SIZE] {
    let mut image = [0_u8; MD_HEADER_SIZE];
    image[0..4].copy_from_slice(&MD_HEADER_MAGIC);
    image[4..8].copy_from_slice(&page_size.get().to_le_bytes());
    image[8..16].copy_from_slice(&tick.0.to_le_bytes());
    image[16..24].copy_from_slice(&(MD_HEADER_SIZE as u64).to_le_bytes());
    image[24..32].copy_from_slice(&index_record_size(num_entries).to_le_bytes());
    let chksum = crc32c::crc32c(&image[..MD_HEADER_BODY_SIZE]);
    image[32..36].copy_from_slice(&chksum.to_le_bytes());
    image
}

/// Decode and validate a header record.
pub fn decode_header(bytes: &[u8]) -> Result<MdHeader> {
    if bytes.len() < MD_HEADER_SIZE {
        return Err(SwmrError::Format(format!(
            "header record truncated: {} bytes, need {MD_HEADER_SIZE}",
            bytes.len()
        )));
    }
    if bytes[0..4] != MD_HEADER_MAGIC {
        return Err(torn("header magic mismatch"));
    }

    let stored = read_le_u32(bytes, MD_HEADER_BODY_SIZE)
        .ok_or_else(|| SwmrError::Format("header checksum out of range".to_owned()))?;
    let computed = crc32c::crc32c(&bytes[..MD_HEADER_BODY_SIZE]);
    if stored != computed {
        return Err(torn(format!(
            "header checksum mismatch: stored {stored:#010x}, computed {computed:#010x}"
        )));
    }

    let page_size = read_le_u32(bytes, 4)
        .ok_or_else(|| SwmrError::Format("truncated header page_size".to_owned()))?;
    let tick_num = read_le_u64(bytes, 8)
        .ok_or_else(|| SwmrError::Format("truncated header tick_num".to_owned()))?;
    let index_offset = read_le_u64(bytes, 16)
        .ok_or_else(|| SwmrError::Format("truncated header index_offset".to_owned()))?;
    let index_length = read_le_u64(bytes, 24)
        .ok_or_else(|| SwmrError::Format("truncated header index_length".to_owned()))?;

    Ok(MdHeader {
        page_size,
        tick_num: Tick(tick_num),
        index_offset,
        index_length,
    })
}

/// Encode the index record for `tick`.
///
/// Entries must already be sorted by `data_page`; offsets wider than the
/// wire's u32 fields are rejected.
pub fn encode_index(tick: Tick, entries: &[PublishedEntry]) -> Result<Vec<u8>> {
    debug_assert!(
        entries.windows(2).all(|w| w[0].data_page < w[1].data_page),
        "index entries must be sorted and unique"
    );

    let num_entries = u32::try_from(entries.len())
        .map_err(|_| SwmrError::Format("index entry count does not fit u32".to_owned()))?;
    let size = usize::try_from(index_record_size(num_entries))
        .map_err(|_| SwmrError::Format("index record size does not fit usize".to_owned()))?;

    let mut image = Vec::with_capacity(size);
    image.extend_from_slice(&MD_INDEX_MAGIC);
    image.extend_from_slice(&tick.0.to_le_bytes());
    image.extend_from_slice(&num_entries.to_le_bytes());

    for entry in entries {
        let data_page = u32::try_from(entry.data_page.0).map_err(|_| {
            SwmrError::Format(format!("data page {} does not fit u32", entry.data_page))
        })?;
        let md_page = u32::try_from(entry.md_page.0).map_err(|_| {
            SwmrError::Format(format!("metadata page {} does not fit u32", entry.md_page))
        })?;
        image.extend_from_slice(&data_page.to_le_bytes());
        image.extend_from_slice(&md_page.to_le_bytes());
        image.extend_from_slice(&entry.length.to_le_bytes());
        image.extend_from_slice(&entry.chksum.to_le_bytes());
    }

    let chksum = crc32c::crc32c(&image);
    image.extend_from_slice(&chksum.to_le_bytes());
    debug_assert_eq!(image.len(), size);
    Ok(image)
}

/// Decode and validate an index record published for `expected_tick`.
pub fn decode_index(bytes: &[u8], expected_tick: Tick) -> Result<Vec<PublishedEntry>> {
    if bytes.len() < MD_INDEX_FIXED_SIZE {
        return Err(torn(format!(
            "index record truncated: {} bytes, need at least {MD_INDEX_FIXED_SIZE}",
            bytes.len()
        )));
    }
    if bytes[0..4] != MD_INDEX_MAGIC {
        return Err(torn("index magic mismatch"));
    }

    let body_len = bytes.len() - 4;
    let stored = read_le_u32(bytes, body_len)
        .ok_or_else(|| SwmrError::Format("index checksum out of range".to_owned()))?;
    let computed = crc32c::crc32c(&bytes[..body_len]);
    if stored != computed {
        return Err(torn(format!(
            "index checksum mismatch: stored {stored:#010x}, computed {computed:#010x}"
        )));
    }

    let tick_num = read_le_u64(bytes, 4)
        .ok_or_else(|| SwmrError::Format("truncated index tick_num".to_owned()))?;
    if Tick(tick_num) != expected_tick {
        return Err(torn(format!(
            "index tick {tick_num} disagrees with header tick {expected_tick}"
        )));
    }

    let num_entries = read_le_u32(bytes, 12)
        .ok_or_else(|| SwmrError::Format("truncated index entry count".to_owned()))?;
    let expected_size = index_record_size(num_entries);
    if u64::try_from(bytes.len()).unwrap_or(u64::MAX) != expected_size {
        return Err(torn(format!(
            "index record is {} bytes, expected {expected_size} for {num_entries} entries",
            bytes.len()
        )));
    }

    let mut entries = Vec::with_capacity(num_entries as usize);
    let mut offset = 16_usize;
    for _ in 0..num_entries {
        let data_page = read_le_u32(bytes, offset)
            .ok_or_else(|| SwmrError::Format("truncated index entry".to_owned()))?;
        let md_page = read_le_u32(bytes, offset + 4)
            .ok_or_else(|| SwmrError::Format("truncated index entry".to_owned()))?;
        let length = read_le_u32(bytes, offset + 8)
            .ok_or_else(|| SwmrError::Format("truncated index entry".to_owned()))?;
        let chksum = read_le_u32(bytes, offset + 12)
            .ok_or_else(|| SwmrError::Format("truncated index entry".to_owned()))?;
        entries.push(PublishedEntry {
            data_page: PageOffset(u64::from(data_page)),
            md_page: MdPageOffset(u64::from(md_page)),
            length,
            chksum,
        });
        offset += MD_INDEX_ENTRY_SIZE;
    }

    if !entries.windows(2).all(|w| w[0].data_page < w[1].data_page) {
        return Err(SwmrError::Format(
            "index entries are not sorted by data page".to_owned(),
        ));
    }

    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_entries() -> Vec<PublishedEntry> {
        vec![
            PublishedEntry {
                data_page: PageOffset(2),
                md_page: MdPageOffset(1),
                length: 4096,
                chksum: 0xDEAD_BEEF,
            },
            PublishedEntry {
                data_page: PageOffset(5),
                md_page: MdPageOffset(3),
                length: 8192,
                chksum: 0x0BAD_F00D,
            },
            PublishedEntry {
                data_page: PageOffset(9),
                md_page: MdPageOffset(2),
                length: 4096,
                chksum: 1,
            },
        ]
    }

    #[test]
    fn header_round_trip() {
        let ps = PageSize::new(4096).unwrap();
        let image = encode_header(Tick(7), ps, 3);
        let header = decode_header(&image).unwrap();
        assert_eq!(header.page_size, 4096);
        assert_eq!(header.tick_num, Tick(7));
        assert_eq!(header.index_offset, MD_HEADER_SIZE as u64);
        assert_eq!(header.index_length, index_record_size(3));
        // Reserved tail must stay zero so in-place overwrites are stable.
        assert!(image[36..].iter().all(|&b| b == 0));
    }

    #[test]
    fn header_length_matches_encoded_index_size() {
        let ps = PageSize::new(4096).unwrap();
        for n in [0_u32, 1, 17] {
            let entries: Vec<PublishedEntry> = (0..n)
                .map(|i| PublishedEntry {
                    data_page: PageOffset(u64::from(i) * 3),
                    md_page: MdPageOffset(u64::from(i) + 1),
                    length: 4096,
                    chksum: i,
                })
                .collect();
            let header = decode_header(&encode_header(Tick(2), ps, n)).unwrap();
            let index = encode_index(Tick(2), &entries).unwrap();
            assert_eq!(header.index_length, index.len() as u64);
        }
    }

    #[test]
    fn header_rejects_flipped_byte() {
        let ps = PageSize::new(4096).unwrap();
        let mut image = encode_header(Tick(3), ps, 0);
        image[9] ^= 0x01;
        assert!(matches!(
            decode_header(&image),
            Err(SwmrError::TornRead { .. })
        ));
    }

    #[test]
    fn header_rejects_bad_magic() {
        let ps = PageSize::new(4096).unwrap();
        let mut image = encode_header(Tick(3), ps, 0);
        image[0] = b'X';
        assert!(matches!(
            decode_header(&image),
            Err(SwmrError::TornRead { .. })
        ));
    }

    #[test]
    fn index_round_trip() {
        let entries = sample_entries();
        let image = encode_index(Tick(12), &entries).unwrap();
        assert_eq!(image.len() as u64, index_record_size(3));
        let decoded = decode_index(&image, Tick(12)).unwrap();
        assert_eq!(decoded, entries);
    }

    #[test]
    fn empty_index_round_trip() {
        let image = encode_index(Tick(1), &[]).unwrap();
        assert_eq!(image.len() as u64, index_record_size(0));
        assert_eq!(decode_index(&image, Tick(1)).unwrap(), Vec::new());
    }

    #[test]
    fn index_rejects_tick_disagreement() {
        let image = encode_index(Tick(4), &sample_entries()).unwrap();
        assert!(matches!(
            decode_index(&image, Tick(5)),
            Err(SwmrError::TornRead { .. })
        ));
    }

    #[test]
    fn index_rejects_corrupt_entry_byte() {
        let mut image = encode_index(Tick(4), &sample_entries()).unwrap();
        image[20] ^= 0xFF;
        assert!(matches!(
            decode_index(&image, Tick(4)),
            Err(SwmrError::TornRead { .. })
        ));
    }

    #[test]
    fn index_rejects_wide_page_offset() {
        let entries = vec![PublishedEntry {
            data_page: PageOffset(u64::from(u32::MAX) + 1),
            md_page: MdPageOffset(1),
            length: 4096,
            chksum: 0,
        }];
        assert!(matches!(
            encode_index(Tick(1), &entries),
            Err(SwmrError::Format(_))
        ));
    }
}
