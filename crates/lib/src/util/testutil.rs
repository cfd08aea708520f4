//! Test utilities for lockwrap-lib.
//!
//! - `PeBuilder` assembles tiny PE32 images (optionally managed, optionally
//!   with resources) that are just valid enough for header parsing.
//! - `stub_compiler` writes `/bin/sh` scripts that stand in for the real
//!   compiler in pipeline tests.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub const RT_ICON: u16 = 3;
pub const RT_GROUP_ICON: u16 = 14;

const PE_OFFSET: usize = 0x80;
const OPTIONAL_HEADER_SIZE: usize = 224;
const FILE_ALIGNMENT: usize = 0x200;
const SECTION_RVA: u32 = 0x1000;
const RESOURCE_DIR_INDEX: usize = 2;
const CLR_DIR_INDEX: usize = 14;

#[derive(Default)]
pub struct PeBuilder {
  managed: bool,
  resources: BTreeMap<u16, BTreeMap<u16, Vec<u8>>>,
  extra_section: Option<(u32, u32)>,
}

impl PeBuilder {
  pub fn new() -> Self {
    Self::default()
  }

  /// Mark the image as a .NET assembly by filling the CLR directory.
  pub fn managed(mut self) -> Self {
    self.managed = true;
    self
  }

  pub fn with_resource(mut self, type_id: u16, name_id: u16, data: &[u8]) -> Self {
    self.resources.entry(type_id).or_default().insert(name_id, data.to_vec());
    self
  }

  /// Add a second section header mapping one page at `rva` to file offset
  /// `pointer_to_raw_data`. No data is written for it.
  pub fn with_extra_section(mut self, rva: u32, pointer_to_raw_data: u32) -> Self {
    self.extra_section = Some((rva, pointer_to_raw_data));
    self
  }

  /// Add a single-image icon group (group 1 referencing icon 1).
  pub fn with_icon(self, image: &[u8]) -> Self {
    let group = group_icon_dir(&[(1, image.len() as u32)]);
    self
      .with_resource(RT_ICON, 1, image)
      .with_resource(RT_GROUP_ICON, 1, &group)
  }

  pub fn build(&self) -> Vec<u8> {
    let rsrc = if self.resources.is_empty() {
      Vec::new()
    } else {
      build_resource_section(&self.resources, SECTION_RVA)
    };

    let raw_size = align(rsrc.len().max(1), FILE_ALIGNMENT);
    let mut image = vec![0u8; FILE_ALIGNMENT + raw_size];

    // DOS header
    image[0..2].copy_from_slice(b"MZ");
    put_u32(&mut image, 0x3c, PE_OFFSET as u32);

    // PE signature + COFF header
    let mut off = PE_OFFSET;
    image[off..off + 4].copy_from_slice(b"PE\0\0");
    off += 4;
    put_u16(&mut image, off, 0x014c); // i386
    put_u16(&mut image, off + 2, if self.extra_section.is_some() { 2 } else { 1 });
    put_u16(&mut image, off + 16, OPTIONAL_HEADER_SIZE as u16);
    put_u16(&mut image, off + 18, 0x0102); // executable, 32-bit
    off += 20;

    // Optional header, PE32
    let opt = off;
    put_u16(&mut image, opt, 0x010b);
    put_u32(&mut image, opt + 28, 0x0040_0000); // image base
    put_u32(&mut image, opt + 32, 0x1000); // section alignment
    put_u32(&mut image, opt + 36, FILE_ALIGNMENT as u32);
    put_u16(&mut image, opt + 48, 4); // subsystem version
    put_u32(&mut image, opt + 56, SECTION_RVA + align(raw_size, 0x1000) as u32); // size of image
    put_u32(&mut image, opt + 60, FILE_ALIGNMENT as u32); // size of headers
    put_u16(&mut image, opt + 68, 3); // console subsystem
    put_u32(&mut image, opt + 72, 0x0010_0000);
    put_u32(&mut image, opt + 76, 0x1000);
    put_u32(&mut image, opt + 80, 0x0010_0000);
    put_u32(&mut image, opt + 84, 0x1000);
    put_u32(&mut image, opt + 92, 16); // number of data directories

    let dirs = opt + 96;
    if !rsrc.is_empty() {
      put_u32(&mut image, dirs + RESOURCE_DIR_INDEX * 8, SECTION_RVA);
      put_u32(&mut image, dirs + RESOURCE_DIR_INDEX * 8 + 4, rsrc.len() as u32);
    }
    if self.managed {
      put_u32(&mut image, dirs + CLR_DIR_INDEX * 8, SECTION_RVA);
      put_u32(&mut image, dirs + CLR_DIR_INDEX * 8 + 4, 0x48);
    }
    off += OPTIONAL_HEADER_SIZE;

    // Section table
    let name: &[u8] = if rsrc.is_empty() { b".text\0\0\0" } else { b".rsrc\0\0\0" };
    image[off..off + 8].copy_from_slice(name);
    put_u32(&mut image, off + 8, rsrc.len().max(1) as u32); // virtual size
    put_u32(&mut image, off + 12, SECTION_RVA);
    put_u32(&mut image, off + 16, raw_size as u32);
    put_u32(&mut image, off + 20, FILE_ALIGNMENT as u32);
    put_u32(&mut image, off + 36, 0x4000_0040); // initialized data, readable

    if let Some((rva, pointer)) = self.extra_section {
      let off = off + 40;
      image[off..off + 8].copy_from_slice(b".data\0\0\0");
      put_u32(&mut image, off + 8, 0x1000);
      put_u32(&mut image, off + 12, rva);
      put_u32(&mut image, off + 16, FILE_ALIGNMENT as u32);
      put_u32(&mut image, off + 20, pointer);
      put_u32(&mut image, off + 36, 0x4000_0040);
    }

    image[FILE_ALIGNMENT..FILE_ALIGNMENT + rsrc.len()].copy_from_slice(&rsrc);
    image
  }
}

/// Serialize a `GRPICONDIR` whose entries reference `(icon id, image size)`.
pub fn group_icon_dir(entries: &[(u16, u32)]) -> Vec<u8> {
  let mut out = Vec::new();
  out.extend_from_slice(&0u16.to_le_bytes());
  out.extend_from_slice(&1u16.to_le_bytes());
  out.extend_from_slice(&(entries.len() as u16).to_le_bytes());
  for (id, size) in entries {
    out.extend_from_slice(&[16, 16, 0, 0]);
    out.extend_from_slice(&1u16.to_le_bytes()); // planes
    out.extend_from_slice(&32u16.to_le_bytes()); // bit count
    out.extend_from_slice(&size.to_le_bytes());
    out.extend_from_slice(&id.to_le_bytes());
  }
  out
}

/// Lay out a three-level resource tree (type / name / language) followed by
/// data entries and raw data.
fn build_resource_section(resources: &BTreeMap<u16, BTreeMap<u16, Vec<u8>>>, section_rva: u32) -> Vec<u8> {
  const SUBDIR: u32 = 0x8000_0000;
  let leaves: Vec<&Vec<u8>> = resources.values().flat_map(|names| names.values()).collect();

  let root_size = 16 + 8 * resources.len();
  let type_dirs_size: usize = resources.values().map(|names| 16 + 8 * names.len()).sum();
  let lang_dirs_offset = root_size + type_dirs_size;
  let data_entries_offset = lang_dirs_offset + leaves.len() * 24;
  let raw_offset = data_entries_offset + leaves.len() * 16;

  let mut out = Vec::new();

  dir_header(&mut out, resources.len());
  let mut type_dir = root_size;
  for (type_id, names) in resources {
    out.extend_from_slice(&u32::from(*type_id).to_le_bytes());
    out.extend_from_slice(&(type_dir as u32 | SUBDIR).to_le_bytes());
    type_dir += 16 + 8 * names.len();
  }

  let mut lang_dir = lang_dirs_offset;
  for names in resources.values() {
    dir_header(&mut out, names.len());
    for name_id in names.keys() {
      out.extend_from_slice(&u32::from(*name_id).to_le_bytes());
      out.extend_from_slice(&(lang_dir as u32 | SUBDIR).to_le_bytes());
      lang_dir += 24;
    }
  }

  for idx in 0..leaves.len() {
    dir_header(&mut out, 1);
    out.extend_from_slice(&0x0409u32.to_le_bytes());
    out.extend_from_slice(&((data_entries_offset + idx * 16) as u32).to_le_bytes());
  }

  let mut raw = raw_offset;
  for data in &leaves {
    out.extend_from_slice(&(section_rva + raw as u32).to_le_bytes());
    out.extend_from_slice(&(data.len() as u32).to_le_bytes());
    out.extend_from_slice(&[0u8; 8]);
    raw += align(data.len(), 4);
  }

  for data in &leaves {
    out.extend_from_slice(data);
    out.resize(align(out.len(), 4), 0);
  }

  out
}

fn dir_header(out: &mut Vec<u8>, id_entries: usize) {
  out.extend_from_slice(&[0u8; 14]);
  out.extend_from_slice(&(id_entries as u16).to_le_bytes());
}

fn align(value: usize, to: usize) -> usize {
  value.div_ceil(to) * to
}

fn put_u16(buf: &mut [u8], offset: usize, value: u16) {
  buf[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

fn put_u32(buf: &mut [u8], offset: usize, value: u32) {
  buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

/// How a stub compiler behaves when invoked.
#[derive(Debug, Clone, Copy)]
pub enum StubCompiler {
  /// Write the concatenated sources to the `/out:` path and exit 0.
  Succeed,
  /// Print a diagnostic line and exit 1 without writing output.
  Fail,
  /// Sleep far longer than any test timeout.
  Hang,
}

/// Write an executable `/bin/sh` script that mimics the compiler's CLI.
///
/// Every invocation also appends its arguments, one per line, to
/// `<dir>/<name>.args` so tests can inspect them.
#[cfg(unix)]
pub fn stub_compiler(dir: &Path, name: &str, behavior: StubCompiler) -> PathBuf {
  use std::os::unix::fs::PermissionsExt;

  let args_log = dir.join(format!("{}.args", name));
  let body = match behavior {
    StubCompiler::Succeed => {
      r#"out=""
srcs=""
for arg in "$@"; do
  case "$arg" in
    /out:*) out="${arg#/out:}" ;;
    /*:*) ;;
    *) srcs="$srcs
$arg" ;;
  esac
done
echo "Microsoft (R) Visual C# Compiler stub"
echo "$srcs" | while IFS= read -r src; do
  [ -n "$src" ] && cat "$src"
done > "$out"
exit 0"#
    }
    StubCompiler::Fail => {
      r#"echo "Template.cs(12,9): error CS1002: ; expected"
echo "Compilation failed: 1 error(s), 0 warnings"
exit 1"#
    }
    StubCompiler::Hang => "sleep 30\nexit 0",
  };

  let script = format!(
    "#!/bin/sh\nfor arg in \"$@\"; do printf '%s\\n' \"$arg\" >> '{}'; done\n{}\n",
    args_log.display(),
    body
  );

  let path = dir.join(name);
  std::fs::write(&path, script).unwrap();
  std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
  path
}

/// Arguments recorded by every run of a stub compiler, in order.
#[cfg(unix)]
pub fn stub_compiler_args(dir: &Path, name: &str) -> Vec<String> {
  std::fs::read_to_string(dir.join(format!("{}.args", name)))
    .map(|s| s.lines().map(str::to_string).collect())
    .unwrap_or_default()
}

/// A template exercising every marker, one of them twice on a line.
pub const TEMPLATE: &str = "namespace LockwrapTemplate {\n  class Template {\n    static string binary /*@BINARY*/;\n    static string filename /*@FILENAME*/;\n    static int isDotNet /*@IS_DOT_NET*/;\n    static string hash /*@EXE_HASH*/; // /*@EXE_HASH*/\n  }\n}\n";

/// Write [`TEMPLATE`] to `dir/Template.cs` and return its path.
pub fn write_template(dir: &Path) -> PathBuf {
  let path = dir.join("Template.cs");
  std::fs::write(&path, TEMPLATE).unwrap();
  path
}
