//! Streaming ZIP writer with data descriptors and ZIP64 support
//!
//! Entries are always stored. Each local header sets general purpose bit 3
//! so CRC and sizes follow the data in a descriptor, which lets the payload
//! be written segment by segment without knowing its final length.

use super::ArchiveError;
use chrono::{Datelike, Timelike, Utc};
use std::io::Write;
use tracing::{debug, trace};

const LOCAL_HEADER_SIG: u32 = 0x0403_4b50;
const DATA_DESCRIPTOR_SIG: u32 = 0x0807_4b50;
const CENTRAL_HEADER_SIG: u32 = 0x0201_4b50;
const ZIP64_EOCD_SIG: u32 = 0x0606_4b50;
const ZIP64_LOCATOR_SIG: u32 = 0x0706_4b50;
const EOCD_SIG: u32 = 0x0605_4b50;

const ZIP64_EXTRA_ID: u16 = 0x0001;
const FLAG_DATA_DESCRIPTOR: u16 = 0x0008;
const VERSION_DEFAULT: u16 = 20;
const VERSION_ZIP64: u16 = 45;
const ZIP64_EOCD_RECORD_SIZE: u64 = 44;

const U32_LIMIT: u64 = 0xFFFF_FFFF;
const U16_LIMIT: usize = 0xFFFF;

/// When to emit ZIP64 structures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Zip64Mode {
    /// Only when a size or offset needs it
    #[default]
    Auto,
    /// For every entry and the end record
    Always,
    /// Never; fail with [`ArchiveError::Zip64Required`] instead
    Never,
}

#[derive(Debug)]
struct CentralEntry {
    name: String,
    crc: u32,
    size: u64,
    offset: u64,
    zip64: bool,
    time: u16,
    date: u16,
}

#[derive(Debug)]
struct OpenEntry {
    name: String,
    offset: u64,
    hasher: crc32fast::Hasher,
    size: u64,
    zip64_header: bool,
    time: u16,
    date: u16,
}

/// Writes a stored-only ZIP archive to any `Write`
#[derive(Debug)]
pub struct ZipWriter<W: Write> {
    inner: W,
    position: u64,
    mode: Zip64Mode,
    entries: Vec<CentralEntry>,
    current: Option<OpenEntry>,
}

fn dos_timestamp() -> (u16, u16) {
    let now = Utc::now();
    let year = now.year().clamp(1980, 2107) as u16;
    let time = ((now.hour() as u16) << 11) | ((now.minute() as u16) << 5) | (now.second() as u16 / 2);
    let date = ((year - 1980) << 9) | ((now.month() as u16) << 5) | now.day() as u16;
    (time, date)
}

impl<W: Write> ZipWriter<W> {
    pub fn new(inner: W, mode: Zip64Mode) -> Self {
        ZipWriter {
            inner,
            position: 0,
            mode,
            entries: Vec::new(),
            current: None,
        }
    }

    /// Bytes written so far
    pub fn position(&self) -> u64 {
        self.position
    }

    fn put(&mut self, bytes: &[u8]) -> Result<(), ArchiveError> {
        self.inner.write_all(bytes)?;
        self.position += bytes.len() as u64;
        Ok(())
    }

    /// Begin a new stored entry
    ///
    /// `size_hint` is the expected entry length when known; in
    /// [`Zip64Mode::Auto`] it decides whether the local header carries a
    /// ZIP64 extra field.
    pub fn start_entry(&mut self, name: &str, size_hint: Option<u64>) -> Result<(), ArchiveError> {
        if self.current.is_some() {
            return Err(ArchiveError::InvalidState("previous entry not finished"));
        }
        if name.len() > U16_LIMIT {
            return Err(ArchiveError::InvalidState("entry name too long"));
        }

        let offset = self.position;
        let needs_zip64 = offset >= U32_LIMIT || size_hint.is_some_and(|s| s >= U32_LIMIT);
        let zip64_header = match self.mode {
            Zip64Mode::Always => true,
            Zip64Mode::Auto => needs_zip64,
            Zip64Mode::Never if needs_zip64 => return Err(ArchiveError::Zip64Required),
            Zip64Mode::Never => false,
        };

        let (time, date) = dos_timestamp();
        let mut header = Vec::with_capacity(30 + name.len() + 20);
        header.extend_from_slice(&LOCAL_HEADER_SIG.to_le_bytes());
        header.extend_from_slice(&(if zip64_header { VERSION_ZIP64 } else { VERSION_DEFAULT }).to_le_bytes());
        header.extend_from_slice(&FLAG_DATA_DESCRIPTOR.to_le_bytes());
        header.extend_from_slice(&0u16.to_le_bytes()); // stored
        header.extend_from_slice(&time.to_le_bytes());
        header.extend_from_slice(&date.to_le_bytes());
        header.extend_from_slice(&0u32.to_le_bytes()); // crc, in descriptor
        let size_field: u32 = if zip64_header { 0xFFFF_FFFF } else { 0 };
        header.extend_from_slice(&size_field.to_le_bytes());
        header.extend_from_slice(&size_field.to_le_bytes());
        header.extend_from_slice(&(name.len() as u16).to_le_bytes());
        header.extend_from_slice(&(if zip64_header { 20u16 } else { 0 }).to_le_bytes());
        header.extend_from_slice(name.as_bytes());
        if zip64_header {
            header.extend_from_slice(&ZIP64_EXTRA_ID.to_le_bytes());
            header.extend_from_slice(&16u16.to_le_bytes());
            header.extend_from_slice(&0u64.to_le_bytes());
            header.extend_from_slice(&0u64.to_le_bytes());
        }
        self.put(&header)?;

        trace!(name, offset, zip64 = zip64_header, "started zip entry");
        self.current = Some(OpenEntry {
            name: name.to_string(),
            offset,
            hasher: crc32fast::Hasher::new(),
            size: 0,
            zip64_header,
            time,
            date,
        });
        Ok(())
    }

    /// Append bytes to the open entry
    pub fn write_data(&mut self, data: &[u8]) -> Result<(), ArchiveError> {
        let entry = self
            .current
            .as_mut()
            .ok_or(ArchiveError::InvalidState("no open entry"))?;
        entry.hasher.update(data);
        entry.size += data.len() as u64;
        if self.mode == Zip64Mode::Never && entry.size >= U32_LIMIT {
            return Err(ArchiveError::Zip64Required);
        }
        self.put(data)
    }

    /// Close the open entry by writing its data descriptor
    pub fn finish_entry(&mut self) -> Result<(), ArchiveError> {
        let entry = self
            .current
            .take()
            .ok_or(ArchiveError::InvalidState("no open entry"))?;
        let crc = entry.hasher.finalize();
        let zip64 = entry.zip64_header || entry.size >= U32_LIMIT || entry.offset >= U32_LIMIT;
        if zip64 && self.mode == Zip64Mode::Never {
            return Err(ArchiveError::Zip64Required);
        }

        let mut descriptor = Vec::with_capacity(24);
        descriptor.extend_from_slice(&DATA_DESCRIPTOR_SIG.to_le_bytes());
        descriptor.extend_from_slice(&crc.to_le_bytes());
        if zip64 {
            descriptor.extend_from_slice(&entry.size.to_le_bytes());
            descriptor.extend_from_slice(&entry.size.to_le_bytes());
        } else {
            descriptor.extend_from_slice(&(entry.size as u32).to_le_bytes());
            descriptor.extend_from_slice(&(entry.size as u32).to_le_bytes());
        }
        self.put(&descriptor)?;

        debug!(name = %entry.name, size = entry.size, zip64, "finished zip entry");
        self.entries.push(CentralEntry {
            name: entry.name,
            crc,
            size: entry.size,
            offset: entry.offset,
            zip64,
            time: entry.time,
            date: entry.date,
        });
        Ok(())
    }

    /// Write a complete entry whose contents are already in memory
    pub fn add_entry(&mut self, name: &str, data: &[u8]) -> Result<(), ArchiveError> {
        self.start_entry(name, Some(data.len() as u64))?;
        self.write_data(data)?;
        self.finish_entry()
    }

    /// Write the central directory and end records, returning the sink
    pub fn finish(mut self) -> Result<W, ArchiveError> {
        if self.current.is_some() {
            return Err(ArchiveError::InvalidState("entry still open"));
        }

        let cd_start = self.position;
        let entries = std::mem::take(&mut self.entries);
        for entry in &entries {
            let mut record = Vec::with_capacity(46 + entry.name.len() + 28);
            let version = if entry.zip64 { VERSION_ZIP64 } else { VERSION_DEFAULT };
            record.extend_from_slice(&CENTRAL_HEADER_SIG.to_le_bytes());
            record.extend_from_slice(&version.to_le_bytes()); // made by
            record.extend_from_slice(&version.to_le_bytes()); // needed
            record.extend_from_slice(&FLAG_DATA_DESCRIPTOR.to_le_bytes());
            record.extend_from_slice(&0u16.to_le_bytes());
            record.extend_from_slice(&entry.time.to_le_bytes());
            record.extend_from_slice(&entry.date.to_le_bytes());
            record.extend_from_slice(&entry.crc.to_le_bytes());
            if entry.zip64 {
                record.extend_from_slice(&0xFFFF_FFFFu32.to_le_bytes());
                record.extend_from_slice(&0xFFFF_FFFFu32.to_le_bytes());
            } else {
                record.extend_from_slice(&(entry.size as u32).to_le_bytes());
                record.extend_from_slice(&(entry.size as u32).to_le_bytes());
            }
            record.extend_from_slice(&(entry.name.len() as u16).to_le_bytes());
            record.extend_from_slice(&(if entry.zip64 { 28u16 } else { 0 }).to_le_bytes());
            record.extend_from_slice(&0u16.to_le_bytes()); // comment
            record.extend_from_slice(&0u16.to_le_bytes()); // disk start
            record.extend_from_slice(&0u16.to_le_bytes()); // internal attrs
            record.extend_from_slice(&0u32.to_le_bytes()); // external attrs
            if entry.zip64 {
                record.extend_from_slice(&0xFFFF_FFFFu32.to_le_bytes());
            } else {
                record.extend_from_slice(&(entry.offset as u32).to_le_bytes());
            }
            record.extend_from_slice(entry.name.as_bytes());
            if entry.zip64 {
                record.extend_from_slice(&ZIP64_EXTRA_ID.to_le_bytes());
                record.extend_from_slice(&24u16.to_le_bytes());
                record.extend_from_slice(&entry.size.to_le_bytes());
                record.extend_from_slice(&entry.size.to_le_bytes());
                record.extend_from_slice(&entry.offset.to_le_bytes());
            }
            self.put(&record)?;
        }
        let cd_end = self.position;
        let cd_size = cd_end - cd_start;
        let count = entries.len() as u64;

        let zip64_end = self.mode == Zip64Mode::Always
            || entries.iter().any(|e| e.zip64)
            || cd_start >= U32_LIMIT
            || cd_size >= U32_LIMIT
            || entries.len() >= U16_LIMIT;
        if zip64_end && self.mode == Zip64Mode::Never {
            return Err(ArchiveError::Zip64Required);
        }

        if zip64_end {
            let mut record = Vec::with_capacity(56 + 20);
            record.extend_from_slice(&ZIP64_EOCD_SIG.to_le_bytes());
            record.extend_from_slice(&ZIP64_EOCD_RECORD_SIZE.to_le_bytes());
            record.extend_from_slice(&VERSION_ZIP64.to_le_bytes());
            record.extend_from_slice(&VERSION_ZIP64.to_le_bytes());
            record.extend_from_slice(&0u32.to_le_bytes());
            record.extend_from_slice(&0u32.to_le_bytes());
            record.extend_from_slice(&count.to_le_bytes());
            record.extend_from_slice(&count.to_le_bytes());
            record.extend_from_slice(&cd_size.to_le_bytes());
            record.extend_from_slice(&cd_start.to_le_bytes());

            record.extend_from_slice(&ZIP64_LOCATOR_SIG.to_le_bytes());
            record.extend_from_slice(&0u32.to_le_bytes());
            record.extend_from_slice(&cd_end.to_le_bytes());
            record.extend_from_slice(&1u32.to_le_bytes());
            self.put(&record)?;
        }

        let mut eocd = Vec::with_capacity(22);
        eocd.extend_from_slice(&EOCD_SIG.to_le_bytes());
        eocd.extend_from_slice(&0u16.to_le_bytes());
        eocd.extend_from_slice(&0u16.to_le_bytes());
        if zip64_end {
            eocd.extend_from_slice(&0xFFFFu16.to_le_bytes());
            eocd.extend_from_slice(&0xFFFFu16.to_le_bytes());
            eocd.extend_from_slice(&0xFFFF_FFFFu32.to_le_bytes());
            eocd.extend_from_slice(&0xFFFF_FFFFu32.to_le_bytes());
        } else {
            eocd.extend_from_slice(&(count as u16).to_le_bytes());
            eocd.extend_from_slice(&(count as u16).to_le_bytes());
            eocd.extend_from_slice(&(cd_size as u32).to_le_bytes());
            eocd.extend_from_slice(&(cd_start as u32).to_le_bytes());
        }
        eocd.extend_from_slice(&0u16.to_le_bytes());
        self.put(&eocd)?;
        self.inner.flush()?;

        debug!(entries = count, bytes = self.position, zip64 = zip64_end, "finished zip archive");
        Ok(self.inner)
    }
}
