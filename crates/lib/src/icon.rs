//! Icon resolution for the wrapped executable.
//!
//! The caller may name an icon file explicitly; it is then handed to the
//! compiler as is. Otherwise the first icon group found in the payload's PE
//! resource section is reassembled into a standalone `.ico` file. Extraction
//! is cosmetic: every failure degrades to "no icon".

use std::io;
use std::path::{Path, PathBuf};

use goblin::pe::PE;
use goblin::pe::section_table::SectionTable;
use thiserror::Error;
use tracing::{debug, info};

use crate::template::write_atomic;
use crate::workspace::remove_stale;

const RT_ICON: u32 = 3;
const RT_GROUP_ICON: u32 = 14;
const SUBDIRECTORY_FLAG: u32 = 0x8000_0000;
const GRPICONDIRENTRY_SIZE: usize = 14;
const ICONDIRENTRY_SIZE: usize = 16;

/// Where the icon passed to the compiler came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IconSource {
  /// Supplied by the caller, used verbatim.
  Explicit(PathBuf),
  /// Rebuilt from the payload's resources and written to the workspace.
  Extracted(PathBuf),
}

impl IconSource {
  pub fn path(&self) -> &Path {
    match self {
      IconSource::Explicit(p) | IconSource::Extracted(p) => p,
    }
  }
}

/// Reasons extraction produced nothing. Never surfaced past this module.
#[derive(Debug, Error)]
enum ExtractError {
  #[error("not a PE image: {0}")]
  NotPe(#[from] goblin::error::Error),
  #[error("no resource section")]
  NoResources,
  #[error("no icon group resource")]
  NoIconGroup,
  #[error("icon {0} referenced by the group is missing")]
  MissingIcon(u16),
  #[error("resource table is malformed at offset {0:#x}")]
  Malformed(usize),
}

/// Pick the icon for the build.
///
/// An explicit icon must exist; a missing one is an I/O error because the
/// caller asked for it. Without one, the stale file at `dest` is removed and
/// an icon extracted from `payload` is written there if possible.
pub fn resolve_icon(payload: &[u8], explicit: Option<&Path>, dest: &Path) -> io::Result<Option<IconSource>> {
  if let Some(path) = explicit {
    if !path.is_file() {
      return Err(io::Error::new(
        io::ErrorKind::NotFound,
        format!("icon file not found: {}", path.display()),
      ));
    }
    debug!(path = ?path, "using explicit icon");
    return Ok(Some(IconSource::Explicit(path.to_path_buf())));
  }

  remove_stale(dest)?;

  match extract_icon(payload) {
    Ok(ico) => {
      write_atomic(dest, &ico)?;
      info!(path = ?dest, bytes = ico.len(), "icon extracted from payload");
      Ok(Some(IconSource::Extracted(dest.to_path_buf())))
    }
    Err(e) => {
      debug!(reason = %e, "no icon extracted");
      Ok(None)
    }
  }
}

/// Rebuild the first `RT_GROUP_ICON` of a PE image as `.ico` file bytes.
fn extract_icon(bytes: &[u8]) -> Result<Vec<u8>, ExtractError> {
  let pe = PE::parse(bytes)?;
  let dir = pe
    .header
    .optional_header
    .as_ref()
    .and_then(|oh| oh.data_directories.get_resource_table().as_ref())
    .map(|d| d.virtual_address)
    .filter(|rva| *rva != 0)
    .ok_or(ExtractError::NoResources)?;

  let table = ResourceTable::new(bytes, &pe.sections, dir)?;

  let group = table.find(RT_GROUP_ICON, None)?.ok_or(ExtractError::NoIconGroup)?;
  let entries = parse_group(group)?;

  let mut images = Vec::with_capacity(entries.len());
  for entry in &entries {
    let image = table
      .find(RT_ICON, Some(u32::from(entry.id)))?
      .ok_or(ExtractError::MissingIcon(entry.id))?;
    images.push(image);
  }

  Ok(assemble_ico(&entries, &images))
}

/// One entry of a `GRPICONDIR`.
struct GroupEntry<'a> {
  /// width, height, color count, reserved, planes, bit count
  header: &'a [u8],
  id: u16,
}

fn parse_group(group: &[u8]) -> Result<Vec<GroupEntry<'_>>, ExtractError> {
  let count = read_u16(group, 4).ok_or(ExtractError::Malformed(4))? as usize;
  let mut entries = Vec::with_capacity(count);
  for i in 0..count {
    let start = 6 + i * GRPICONDIRENTRY_SIZE;
    let end = start + GRPICONDIRENTRY_SIZE;
    if end > group.len() {
      return Err(ExtractError::Malformed(start));
    }
    entries.push(GroupEntry {
      header: &group[start..start + 8],
      id: read_u16(group, start + 12).ok_or(ExtractError::Malformed(start + 12))?,
    });
  }
  if entries.is_empty() {
    return Err(ExtractError::NoIconGroup);
  }
  Ok(entries)
}

/// Lay out `ICONDIR`, one `ICONDIRENTRY` per image, then the image data.
fn assemble_ico(entries: &[GroupEntry<'_>], images: &[&[u8]]) -> Vec<u8> {
  let mut out = Vec::new();
  out.extend_from_slice(&0u16.to_le_bytes());
  out.extend_from_slice(&1u16.to_le_bytes());
  out.extend_from_slice(&(entries.len() as u16).to_le_bytes());

  let mut offset = 6 + entries.len() * ICONDIRENTRY_SIZE;
  for (entry, image) in entries.iter().zip(images) {
    out.extend_from_slice(entry.header);
    out.extend_from_slice(&(image.len() as u32).to_le_bytes());
    out.extend_from_slice(&(offset as u32).to_le_bytes());
    offset += image.len();
  }
  for image in images {
    out.extend_from_slice(image);
  }
  out
}

/// Read-only view over a PE resource directory tree.
struct ResourceTable<'a> {
  bytes: &'a [u8],
  sections: &'a [SectionTable],
  /// File offset of the root directory.
  base: usize,
}

impl<'a> ResourceTable<'a> {
  fn new(bytes: &'a [u8], sections: &'a [SectionTable], rva: u32) -> Result<Self, ExtractError> {
    let base = rva_to_offset(sections, rva).ok_or(ExtractError::NoResources)?;
    Ok(Self { bytes, sections, base })
  }

  /// Data of the first language of resource `type_id`, either the first name
  /// or the one with numeric id `name_id`.
  fn find(&self, type_id: u32, name_id: Option<u32>) -> Result<Option<&'a [u8]>, ExtractError> {
    let Some(types) = self.lookup(0, Some(type_id))? else {
      return Ok(None);
    };
    let types = self.subdirectory(types)?;
    let Some(names) = self.lookup(types, name_id)? else {
      return Ok(None);
    };
    let names = self.subdirectory(names)?;
    let Some(lang) = self.lookup(names, None)? else {
      return Ok(None);
    };
    if lang & SUBDIRECTORY_FLAG != 0 {
      return Err(ExtractError::Malformed(names));
    }
    self.data(lang as usize).map(Some)
  }

  /// Offset field of the first entry in the directory at `dir` (relative to
  /// the root) whose id matches, or of the first entry when `id` is `None`.
  fn lookup(&self, dir: usize, id: Option<u32>) -> Result<Option<u32>, ExtractError> {
    let at = self.base + dir;
    let named = self.u16_at(at + 12)? as usize;
    let ids = self.u16_at(at + 14)? as usize;

    for i in 0..named + ids {
      let entry = at + 16 + i * 8;
      let name = self.u32_at(entry)?;
      let offset = self.u32_at(entry + 4)?;
      match id {
        None => return Ok(Some(offset)),
        Some(want) if name & SUBDIRECTORY_FLAG == 0 && name == want => return Ok(Some(offset)),
        _ => {}
      }
    }
    Ok(None)
  }

  fn subdirectory(&self, offset: u32) -> Result<usize, ExtractError> {
    if offset & SUBDIRECTORY_FLAG == 0 {
      return Err(ExtractError::Malformed(offset as usize));
    }
    Ok((offset & !SUBDIRECTORY_FLAG) as usize)
  }

  fn data(&self, entry: usize) -> Result<&'a [u8], ExtractError> {
    let at = self.base + entry;
    let rva = self.u32_at(at)?;
    let size = self.u32_at(at + 4)? as usize;
    let start = rva_to_offset(self.sections, rva).ok_or(ExtractError::Malformed(at))?;
    self
      .bytes
      .get(start..start.saturating_add(size))
      .ok_or(ExtractError::Malformed(start))
  }

  fn u16_at(&self, at: usize) -> Result<u16, ExtractError> {
    read_u16(self.bytes, at).ok_or(ExtractError::Malformed(at))
  }

  fn u32_at(&self, at: usize) -> Result<u32, ExtractError> {
    self
      .bytes
      .get(at..at + 4)
      .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
      .ok_or(ExtractError::Malformed(at))
  }
}

fn read_u16(bytes: &[u8], at: usize) -> Option<u16> {
  bytes.get(at..at + 2).map(|b| u16::from_le_bytes([b[0], b[1]]))
}

/// File offset of `rva`, or `None` when no section maps it or the section's
/// raw pointer would push the offset out of range.
fn rva_to_offset(sections: &[SectionTable], rva: u32) -> Option<usize> {
  let section = sections.iter().find(|s| {
    let span = s.virtual_size.max(s.size_of_raw_data);
    rva >= s.virtual_address && rva < s.virtual_address.saturating_add(span)
  })?;
  let delta = usize::try_from(rva - section.virtual_address).ok()?;
  usize::try_from(section.pointer_to_raw_data).ok()?.checked_add(delta)
}
