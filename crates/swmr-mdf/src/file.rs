//! Scoped handle over the metadata file.
//!
//! The writer creates the file truncated to exactly
//! `md_pages_reserved * page_size` bytes and rewrites the header and index
//! in place each tick; readers open it read-only and poll. I/O uses
//! pread/pwrite so no seek position is shared.
//!
//! Publication protocol: the writer writes the index record first, then
//! the header — the header's tick number commits the tick. A reader reads
//! header, index, header and treats any checksum or tick disagreement as a
//! torn read, retrying under a bounded budget.

use crate::codec::{self, MD_HEADER_SIZE, MdHeader};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use swmr_error::{Result, SwmrError};
use swmr_types::cx::Cx;
use swmr_types::{MdPageOffset, PageSize, PublishedEntry};
use tracing::{debug, trace, warn};

/// Bounded retry budget for torn reads. Readers never sleep between
/// attempts; the writer's in-place rewrite window is a few syscalls wide.
pub const MD_LOAD_RETRY_MAX: u32 = 10;

/// Open metadata file plus the bookkeeping the publication protocol needs.
#[derive(Debug)]
pub struct MetadataFile {
    file: File,
    path: PathBuf,
    len: u64,
    page_size: Option<PageSize>,
    writable: bool,
    unusable: bool,
}

impl MetadataFile {
    /// Create (or clobber) the writer-side metadata file, truncated to
    /// exactly `len` bytes.
    pub fn create(cx: &Cx, path: impl AsRef<Path>, page_size: PageSize, len: u64) -> Result<Self> {
        cx.checkpoint()?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path.as_ref())?;
        file.set_len(len)?;
        debug!(
            target: "swmr::mdf",
            event = "create",
            path = %path.as_ref().display(),
            len,
        );
        Ok(Self {
            file,
            path: path.as_ref().to_path_buf(),
            len,
            page_size: Some(page_size),
            writable: true,
            unusable: false,
        })
    }

    /// Open an existing metadata file read-only (reader side).
    pub fn open_readonly(cx: &Cx, path: impl AsRef<Path>) -> Result<Self> {
        cx.checkpoint()?;
        let file = OpenOptions::new().read(true).open(path.as_ref())?;
        let len = file.metadata()?.len();
        debug!(
            target: "swmr::mdf",
            event = "open_readonly",
            path = %path.as_ref().display(),
            len,
        );
        Ok(Self {
            file,
            path: path.as_ref().to_path_buf(),
            len,
            page_size: None,
            writable: false,
            unusable: false,
        })
    }

    #[must_use]
    pub fn len_bytes(&self) -> u64 {
        self.len
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn ensure_usable(&self) -> Result<()> {
        if self.unusable {
            Err(SwmrError::FileUnusable)
        } else {
            Ok(())
        }
    }

    fn read_exact_at(&self, cx: &Cx, offset: u64, buf: &mut [u8]) -> Result<()> {
        cx.checkpoint()?;
        let end = offset
            .checked_add(u64::try_from(buf.len()).unwrap_or(u64::MAX))
            .ok_or_else(|| SwmrError::Format("read range overflows u64".to_owned()))?;
        if end > self.len {
            return Err(SwmrError::Format(format!(
                "read out of bounds: offset={offset} len={} file_len={}",
                buf.len(),
                self.len
            )));
        }
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }

    fn write_all_at(&self, cx: &Cx, offset: u64, buf: &[u8]) -> Result<()> {
        cx.checkpoint()?;
        if !self.writable {
            return Err(SwmrError::Format(
                "metadata file opened read-only".to_owned(),
            ));
        }
        let end = offset
            .checked_add(u64::try_from(buf.len()).unwrap_or(u64::MAX))
            .ok_or_else(|| SwmrError::Format("write range overflows u64".to_owned()))?;
        if end > self.len {
            return Err(SwmrError::Format(format!(
                "write out of bounds: offset={offset} len={} file_len={}",
                buf.len(),
                self.len
            )));
        }
        self.file.write_all_at(buf, offset)?;
        Ok(())
    }

    /// Write one page image at its allocated metadata-file region.
    pub fn write_image(&self, cx: &Cx, md_page: MdPageOffset, bytes: &[u8]) -> Result<()> {
        self.ensure_usable()?;
        let page_size = self
            .page_size
            .ok_or_else(|| SwmrError::Format("image write on a read-only handle".to_owned()))?;
        if md_page.0 == 0 {
            return Err(SwmrError::Format(
                "page 0 of the metadata file is reserved for header and index".to_owned(),
            ));
        }
        let offset = page_size
            .byte_of_md_page(md_page)
            .ok_or_else(|| SwmrError::Format("image offset overflows u64".to_owned()))?;
        trace!(
            target: "swmr::mdf",
            event = "write_image",
            md_page = md_page.0,
            len = bytes.len(),
        );
        self.write_all_at(cx, offset, bytes)
    }

    /// Publish one tick: encode nothing here, just land `index_bytes` then
    /// `header_bytes`, in that order. Any failure marks the handle
    /// unusable — the file may now show a half-written record and no later
    /// publication can be trusted to repair it.
    pub fn publish(
        &mut self,
        cx: &Cx,
        index_bytes: &[u8],
        header_bytes: &[u8; MD_HEADER_SIZE],
    ) -> Result<()> {
        self.ensure_usable()?;
        let page_size = self
            .page_size
            .ok_or_else(|| SwmrError::Format("publish on a read-only handle".to_owned()))?;

        // The index record must stay inside page 0; images live from
        // page 1 upward.
        let record_end = MD_HEADER_SIZE
            .checked_add(index_bytes.len())
            .ok_or_else(|| SwmrError::Format("index record size overflows usize".to_owned()))?;
        if record_end > page_size.get() as usize {
            return Err(SwmrError::NoSpace);
        }

        // Re-verify the header image before it lands on disk, and make
        // sure it promises exactly the index we are about to write.
        let header = codec::decode_header(header_bytes)?;
        if header.index_length != u64::try_from(index_bytes.len()).unwrap_or(u64::MAX) {
            return Err(SwmrError::Format(format!(
                "header promises {} index bytes but {} were encoded",
                header.index_length,
                index_bytes.len()
            )));
        }

        let result = self
            .write_all_at(cx, MD_HEADER_SIZE as u64, index_bytes)
            .and_then(|()| self.write_all_at(cx, 0, header_bytes));
        if result.is_err() {
            self.unusable = true;
        } else {
            debug!(
                target: "swmr::mdf",
                event = "publish",
                tick = header.tick_num.0,
                index_len = index_bytes.len(),
            );
        }
        result
    }

    /// Read and validate the header once (no retry).
    pub fn read_header(&self, cx: &Cx) -> Result<MdHeader> {
        let mut buf = [0_u8; MD_HEADER_SIZE];
        self.read_exact_at(cx, 0, &mut buf)?;
        codec::decode_header(&buf)
    }

    /// Read the header, retrying torn reads up to [`MD_LOAD_RETRY_MAX`].
    pub fn load_header(&self, cx: &Cx) -> Result<MdHeader> {
        for _attempt in 0..MD_LOAD_RETRY_MAX {
            match self.read_header(cx) {
                Ok(header) => return Ok(header),
                Err(SwmrError::TornRead { detail }) => {
                    trace!(target: "swmr::mdf", event = "torn_header", detail = %detail);
                }
                Err(other) => return Err(other),
            }
        }
        Err(SwmrError::ReadRetriesExhausted {
            attempts: MD_LOAD_RETRY_MAX,
        })
    }

    /// Header–Index–Header load: fetch a consistent (tick, entries) pair,
    /// retrying torn reads up to [`MD_LOAD_RETRY_MAX`].
    pub fn load_published(&self, cx: &Cx) -> Result<(MdHeader, Vec<PublishedEntry>)> {
        for _attempt in 0..MD_LOAD_RETRY_MAX {
            match self.try_load_published(cx) {
                Ok(loaded) => return Ok(loaded),
                Err(SwmrError::TornRead { detail }) => {
                    trace!(target: "swmr::mdf", event = "torn_load", detail = %detail);
                }
                Err(other) => return Err(other),
            }
        }
        Err(SwmrError::ReadRetriesExhausted {
            attempts: MD_LOAD_RETRY_MAX,
        })
    }

    fn try_load_published(&self, cx: &Cx) -> Result<(MdHeader, Vec<PublishedEntry>)> {
        let first = self.read_header(cx)?;

        let index_len = usize::try_from(first.index_length)
            .map_err(|_| SwmrError::Format("index length does not fit usize".to_owned()))?;
        let index_end = first
            .index_offset
            .checked_add(first.index_length)
            .ok_or_else(|| SwmrError::Format("index range overflows u64".to_owned()))?;
        if index_end > self.len {
            return Err(SwmrError::Format(format!(
                "index record [{}, {index_end}) exceeds file length {}",
                first.index_offset, self.len
            )));
        }

        let mut index_bytes = vec![0_u8; index_len];
        self.read_exact_at(cx, first.index_offset, &mut index_bytes)?;
        let entries = codec::decode_index(&index_bytes, first.tick_num)?;

        // The header commits the tick; if it moved while we were reading
        // the index, the pair cannot be trusted.
        let second = self.read_header(cx)?;
        if second.tick_num != first.tick_num {
            return Err(SwmrError::TornRead {
                detail: format!(
                    "tick advanced from {} to {} during index read",
                    first.tick_num, second.tick_num
                ),
            });
        }

        Ok((first, entries))
    }

    /// Close and unlink the metadata file. Unlink failures are logged and
    /// swallowed; at this point the writer has already quiesced.
    pub fn close_and_unlink(self, cx: &Cx) -> Result<()> {
        cx.checkpoint()?;
        drop(self.file);
        if let Err(err) = std::fs::remove_file(&self.path) {
            warn!(
                target: "swmr::mdf",
                event = "unlink_failed",
                path = %self.path.display(),
                error = %err,
            );
        } else {
            debug!(
                target: "swmr::mdf",
                event = "unlinked",
                path = %self.path.display(),
            );
        }
        Ok(())
    }
}
