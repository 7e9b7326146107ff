use std::ffi::OsStr;
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use flate2::{read::GzDecoder, Compression, GzBuilder};
use serde::Serialize;
use tar::{EntryType, Header};
use tracing::debug;

use super::{replace_file, MemberRecord};
use crate::epoch::Epoch;

#[derive(Debug, Clone, Serialize)]
pub struct SdistReport {
    pub path: PathBuf,
    pub members: usize,
    pub epoch: Epoch,
}

#[derive(Debug)]
struct SdistMember {
    record: MemberRecord,
    entry_type: EntryType,
    link_name: Option<PathBuf>,
}

impl SdistMember {
    fn is_link(&self) -> bool {
        matches!(self.entry_type, EntryType::Symlink | EntryType::Link)
    }
}

/// Rewrite a gzipped tar sdist in place with normalized member metadata.
///
/// Members keep their order, paths, link targets and contents. Each one is
/// stamped with `epoch`, owned by uid/gid 0 with empty owner names, and
/// gets mode 0o755 or 0o644. The gzip layer is written uncompressed with
/// `epoch` in its header, and the file itself is touched to `epoch`.
///
/// # Errors
/// Returns an error if the archive cannot be read or the rewrite fails.
pub fn cleanse_sdist(path: &Path, epoch: Epoch) -> Result<SdistReport> {
    let members = read_members(path)?;
    let count = members.len();
    replace_file(path, Some(epoch), |file| {
        write_members(file, &members, epoch, gzip_member_name(path))
    })?;
    debug!(sdist = %path.display(), members = count, %epoch, "cleansed sdist");
    Ok(SdistReport {
        path: path.to_path_buf(),
        members: count,
        epoch,
    })
}

fn read_members(path: &Path) -> Result<Vec<SdistMember>> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let mut archive = tar::Archive::new(GzDecoder::new(file));
    let mut members = Vec::new();
    for entry in archive
        .entries()
        .with_context(|| format!("reading {}", path.display()))?
    {
        let mut entry = entry.with_context(|| format!("reading {}", path.display()))?;
        let entry_type = entry.header().entry_type();
        if entry_type == EntryType::XGlobalHeader {
            debug!(sdist = %path.display(), "dropping pax global header");
            continue;
        }
        let member_path = entry.path()?.into_owned();
        let link_name = entry.link_name()?.map(|link| link.into_owned());
        let mode = entry.header().mode()? & 0o7777;
        let mut data = Vec::new();
        entry
            .read_to_end(&mut data)
            .with_context(|| format!("reading {} from {}", member_path.display(), path.display()))?;
        members.push(SdistMember {
            record: MemberRecord {
                path: member_path,
                data,
                mode,
                is_dir: entry_type.is_dir(),
            },
            entry_type,
            link_name,
        });
    }
    Ok(members)
}

fn write_members(
    file: &mut File,
    members: &[SdistMember],
    epoch: Epoch,
    gzip_name: Option<String>,
) -> Result<()> {
    let mut gzip = GzBuilder::new().mtime(epoch.gzip_mtime());
    if let Some(name) = gzip_name {
        gzip = gzip.filename(name);
    }
    let encoder = gzip.write(file, Compression::none());
    let mut builder = tar::Builder::new(encoder);
    for member in members {
        let mut header = Header::new_gnu();
        header.set_entry_type(canonical_entry_type(member.entry_type));
        header.set_mtime(epoch.secs());
        header.set_uid(0);
        header.set_gid(0);
        header.set_username("")?;
        header.set_groupname("")?;
        let record = &member.record;
        if member.is_link() {
            header.set_mode(super::EXECUTABLE_MODE);
            header.set_size(0);
            let target = member.link_name.as_deref().unwrap_or_else(|| Path::new(""));
            builder
                .append_link(&mut header, &record.path, target)
                .with_context(|| format!("writing link {}", record.path.display()))?;
        } else {
            header.set_mode(record.normalized_mode());
            header.set_size(record.data.len() as u64);
            builder
                .append_data(&mut header, &record.path, record.data.as_slice())
                .with_context(|| format!("writing {}", record.path.display()))?;
        }
    }
    let encoder = builder.into_inner()?;
    encoder.finish()?;
    Ok(())
}

// Contiguous and sparse members are read back in full, so they are written
// as plain files.
fn canonical_entry_type(entry_type: EntryType) -> EntryType {
    match entry_type {
        EntryType::Continuous | EntryType::GNUSparse => EntryType::Regular,
        other => other,
    }
}

/// The name stored in the gzip header: the archive's file name without `.gz`.
fn gzip_member_name(path: &Path) -> Option<String> {
    let name = path.file_name().and_then(OsStr::to_str)?;
    Some(name.strip_suffix(".gz").unwrap_or(name).to_string())
}

/// Whether any member of the sdist is a C source file.
///
/// # Errors
/// Returns an error if the archive cannot be read.
pub fn contains_c_sources(path: &Path) -> Result<bool> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let mut archive = tar::Archive::new(GzDecoder::new(file));
    for entry in archive.entries()? {
        let entry = entry?;
        let is_c = entry
            .path()?
            .extension()
            .is_some_and(|ext| ext == OsStr::new("c"));
        if is_c {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Unpack an sdist into `dest`, returning its single top-level directory.
///
/// # Errors
/// Returns an error if extraction fails or the archive does not contain
/// exactly one top-level directory.
pub fn extract_sdist(path: &Path, dest: &Path) -> Result<PathBuf> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let mut archive = tar::Archive::new(GzDecoder::new(file));
    archive.set_preserve_mtime(true);
    archive
        .unpack(dest)
        .with_context(|| format!("extracting {} into {}", path.display(), dest.display()))?;
    let mut roots = std::fs::read_dir(dest)?
        .map(|entry| entry.map(|entry| entry.path()))
        .collect::<io::Result<Vec<_>>>()?;
    roots.sort();
    match roots.as_slice() {
        [root] if root.is_dir() => Ok(root.clone()),
        _ => Err(anyhow::anyhow!(
            "{} must contain exactly one top-level directory (found {})",
            path.display(),
            roots.len()
        )),
    }
}
