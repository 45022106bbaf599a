//! Initrd
//!
//! Flat boot image mounted read-only at `/boot`: the magic `FXINITRD`
//! (8 bytes), a u32 entry count, then one 72-byte record per file
//! (64-byte NUL-padded name, u32 offset from image start, u32 size),
//! followed by the file data. Reads are direct slices into the image;
//! writes fail. An empty image is a valid 12-byte prefix.

use spin::Mutex;

const MAGIC: &[u8; 8] = b"FXINITRD";
const NAME_LEN: usize = 64;
const ENTRY_LEN: usize = NAME_LEN + 8;
const HEADER_LEN: usize = 12;

#[derive(Clone, Copy)]
struct Image {
    base: *const u8,
    size: usize,
    count: usize,
}

// The image lives in reserved boot memory for the kernel's lifetime.
unsafe impl Send for Image {}

static IMAGE: Mutex<Option<Image>> = Mutex::new(None);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitrdError {
    BadMagic,
    Truncated,
}

fn image_bytes(img: &Image) -> &'static [u8] {
    unsafe { core::slice::from_raw_parts(img.base, img.size) }
}

/// Validate an image header. Usable standalone for tests and the packer.
pub fn validate(data: &[u8]) -> Result<usize, InitrdError> {
    if data.len() < HEADER_LEN {
        return Err(InitrdError::Truncated);
    }
    if &data[..8] != MAGIC {
        return Err(InitrdError::BadMagic);
    }
    let count = u32::from_le_bytes([data[8], data[9], data[10], data[11]]) as usize;
    if HEADER_LEN + count * ENTRY_LEN > data.len() {
        return Err(InitrdError::Truncated);
    }
    for i in 0..count {
        let at = HEADER_LEN + i * ENTRY_LEN;
        let offset = u32::from_le_bytes([
            data[at + NAME_LEN],
            data[at + NAME_LEN + 1],
            data[at + NAME_LEN + 2],
            data[at + NAME_LEN + 3],
        ]) as usize;
        let size = u32::from_le_bytes([
            data[at + NAME_LEN + 4],
            data[at + NAME_LEN + 5],
            data[at + NAME_LEN + 6],
            data[at + NAME_LEN + 7],
        ]) as usize;
        if offset + size > data.len() {
            return Err(InitrdError::Truncated);
        }
    }
    Ok(count)
}

/// Adopt the boot module as the `/boot` tree.
///
/// # Safety
/// `base..base+size` must stay mapped and untouched for the kernel's
/// lifetime.
pub unsafe fn init(base: *const u8, size: usize) -> Result<(), InitrdError> {
    let data = core::slice::from_raw_parts(base, size);
    let count = validate(data)?;
    *IMAGE.lock() = Some(Image { base, size, count });
    crate::kinfo!("initrd: {} files, {} bytes", count, size);
    Ok(())
}

fn entry_name(data: &[u8], idx: usize) -> &[u8] {
    let at = HEADER_LEN + idx * ENTRY_LEN;
    let name = &data[at..at + NAME_LEN];
    let len = name.iter().position(|&b| b == 0).unwrap_or(NAME_LEN);
    &name[..len]
}

fn entry_slice(data: &'static [u8], idx: usize) -> &'static [u8] {
    let at = HEADER_LEN + idx * ENTRY_LEN;
    let offset = u32::from_le_bytes([
        data[at + NAME_LEN],
        data[at + NAME_LEN + 1],
        data[at + NAME_LEN + 2],
        data[at + NAME_LEN + 3],
    ]) as usize;
    let size = u32::from_le_bytes([
        data[at + NAME_LEN + 4],
        data[at + NAME_LEN + 5],
        data[at + NAME_LEN + 6],
        data[at + NAME_LEN + 7],
    ]) as usize;
    &data[offset..offset + size]
}

/// Find a packed file by name, returning its entry index.
pub fn lookup_index(name: &str) -> Option<usize> {
    let guard = IMAGE.lock();
    let img = guard.as_ref()?;
    let data = image_bytes(img);
    for idx in 0..img.count {
        if entry_name(data, idx) == name.as_bytes() {
            return Some(idx);
        }
    }
    None
}

/// Byte content of entry `idx`.
pub fn entry_data(idx: usize) -> Option<&'static [u8]> {
    let guard = IMAGE.lock();
    let img = guard.as_ref()?;
    if idx >= img.count {
        return None;
    }
    Some(entry_slice(image_bytes(img), idx))
}

/// Convenience lookup by name.
pub fn lookup(name: &str) -> Option<&'static [u8]> {
    entry_data(lookup_index(name)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pack(files: &[(&str, &[u8])]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&(files.len() as u32).to_le_bytes());
        let data_start = HEADER_LEN + files.len() * ENTRY_LEN;
        let mut offset = data_start;
        for (name, data) in files {
            let mut rec = [0u8; ENTRY_LEN];
            rec[..name.len()].copy_from_slice(name.as_bytes());
            rec[NAME_LEN..NAME_LEN + 4].copy_from_slice(&(offset as u32).to_le_bytes());
            rec[NAME_LEN + 4..].copy_from_slice(&(data.len() as u32).to_le_bytes());
            out.extend_from_slice(&rec);
            offset += data.len();
        }
        for (_, data) in files {
            out.extend_from_slice(data);
        }
        out
    }

    #[test]
    fn empty_image_is_valid() {
        let mut img = Vec::new();
        img.extend_from_slice(MAGIC);
        img.extend_from_slice(&0u32.to_le_bytes());
        assert_eq!(validate(&img), Ok(0));
    }

    #[test]
    fn bad_magic_rejected() {
        let img = pack(&[("init", b"elf")]);
        let mut broken = img.clone();
        broken[0] = b'X';
        assert_eq!(validate(&broken), Err(InitrdError::BadMagic));
    }

    #[test]
    fn truncated_entry_table_rejected() {
        let img = pack(&[("init", b"elf")]);
        assert_eq!(validate(&img[..HEADER_LEN + 10]), Err(InitrdError::Truncated));
    }

    #[test]
    fn out_of_range_data_rejected() {
        let mut img = pack(&[("init", b"elf")]);
        // Corrupt the size field to reach past the end.
        let at = HEADER_LEN + NAME_LEN + 4;
        img[at..at + 4].copy_from_slice(&0xFFFFu32.to_le_bytes());
        assert_eq!(validate(&img), Err(InitrdError::Truncated));
    }

    #[test]
    fn packed_file_round_trips() {
        let content = b"#!/bin/rc\necho hi\n";
        let img = pack(&[("rc", b"rcrc"), ("hello", content)]);
        let leaked: &'static [u8] = Box::leak(img.into_boxed_slice());
        unsafe { init(leaked.as_ptr(), leaked.len()).unwrap() };
        assert_eq!(lookup("hello"), Some(&content[..]));
        assert_eq!(lookup("rc"), Some(&b"rcrc"[..]));
        assert_eq!(lookup("missing"), None);
    }
}
