//! Zip extraction for downloaded packages.

use std::{
  fs,
  io::{self, Cursor},
};

use zip::ZipArchive;

use super::*;

/// Extracts a zip archive held in memory into `dest`.
///
/// When every entry lives under one common top-level directory (as with GitHub zipballs), that
/// directory is stripped. Entries with absolute paths or `..` components are rejected and
/// nothing outside `dest` is ever written.
pub fn extract_zip(bytes: &[u8], dest: &Path) -> Result<()> {
  let mut archive = ZipArchive::new(Cursor::new(bytes))?;

  let mut names = Vec::with_capacity(archive.len());
  for i in 0..archive.len() {
    let file = archive.by_index(i)?;
    let name = file.enclosed_name().ok_or_else(|| {
      BibolamaziError::Config(format!("archive entry `{}` escapes the extraction directory", file.name()))
    })?;
    names.push((name, file.is_dir()));
  }

  let prefix = common_top_dir(&names);
  fs::create_dir_all(dest)?;
  for (i, (name, is_dir)) in names.into_iter().enumerate() {
    let relative = match &prefix {
      Some(prefix) => name.strip_prefix(prefix).map(Path::to_path_buf).unwrap_or(name),
      None => name,
    };
    if relative.as_os_str().is_empty() {
      continue;
    }
    let out_path = dest.join(&relative);
    if is_dir {
      fs::create_dir_all(&out_path)?;
      continue;
    }
    if let Some(parent) = out_path.parent() {
      fs::create_dir_all(parent)?;
    }
    let mut file = archive.by_index(i)?;
    let mut out = fs::File::create(&out_path)?;
    io::copy(&mut file, &mut out)?;
  }
  trace!(dest = %dest.display(), "Extracted archive");
  Ok(())
}

/// The single top-level directory shared by all entries, if there is one.
fn common_top_dir(names: &[(PathBuf, bool)]) -> Option<PathBuf> {
  let mut top: Option<PathBuf> = None;
  for (name, is_dir) in names {
    let mut components = name.components();
    let first = PathBuf::from(components.next()?.as_os_str());
    // a file sitting at the top level means there is nothing to strip
    if components.next().is_none() && !is_dir {
      return None;
    }
    match &top {
      Some(existing) if *existing != first => return None,
      Some(_) => {},
      None => top = Some(first),
    }
  }
  top
}
