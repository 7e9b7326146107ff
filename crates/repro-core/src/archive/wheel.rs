use std::cmp::Ordering;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use filetime::{set_file_times, FileTime};
use serde::Serialize;
use tracing::debug;
use zip::{write::FileOptions, CompressionMethod, DateTime, ZipArchive, ZipWriter};

use super::{replace_file, MemberRecord};
use crate::epoch::Epoch;

#[derive(Debug, Clone, Serialize)]
pub struct WheelReport {
    pub path: PathBuf,
    pub members: usize,
    pub epoch: Epoch,
    pub sorted: bool,
}

#[derive(Debug)]
struct WheelMember {
    record: MemberRecord,
    method: CompressionMethod,
    modified: DateTime,
}

impl WheelMember {
    fn name(&self) -> String {
        self.record.path.to_string_lossy().into_owned()
    }
}

struct WheelContents {
    members: Vec<WheelMember>,
    comment: Vec<u8>,
}

/// Rewrite a wheel in place with normalized member metadata.
///
/// Member order and contents are preserved. Every member gets `epoch` as its
/// modification time and mode 0o755 or 0o644; extra fields are dropped and
/// deflated members are re-deflated at level 0.
///
/// # Errors
/// Returns an error if the wheel cannot be read, `epoch` cannot be stored as
/// a zip timestamp, or the rewrite fails.
pub fn normalize_wheel(path: &Path, epoch: Epoch) -> Result<WheelReport> {
    let modified = epoch.to_zip_datetime()?;
    let mut contents = read_wheel(path)?;
    for member in &mut contents.members {
        member.record.mode = member.record.normalized_mode();
        member.modified = modified;
    }
    let count = contents.members.len();
    replace_file(path, Some(epoch), |file| write_wheel(file, &contents))?;
    debug!(wheel = %path.display(), members = count, %epoch, "normalized wheel");
    Ok(WheelReport {
        path: path.to_path_buf(),
        members: count,
        epoch,
        sorted: false,
    })
}

/// Reorder a wheel the way pypa/wheel writes one.
///
/// Plain files come first, then `*.dist-info` contents, then `RECORD`; each
/// group is ordered with [`breadth_first_key`]. Lines inside `RECORD` are
/// sorted with the same rules. The file's own timestamps are kept.
///
/// # Errors
/// Returns an error if the wheel cannot be read or rewritten.
pub fn sort_wheel(path: &Path) -> Result<()> {
    let metadata = fs::metadata(path)?;
    let atime = FileTime::from_last_access_time(&metadata);
    let mtime = FileTime::from_last_modification_time(&metadata);

    let mut contents = read_wheel(path)?;
    contents
        .members
        .sort_by(|a, b| compare_paths(&a.name(), &b.name()));
    for member in &mut contents.members {
        if member.name().ends_with("RECORD") {
            member.record.data = sort_record(&member.record.data);
        }
    }
    replace_file(path, None, |file| write_wheel(file, &contents))?;
    set_file_times(path, atime, mtime)?;
    debug!(wheel = %path.display(), "sorted wheel members");
    Ok(())
}

fn read_wheel(path: &Path) -> Result<WheelContents> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let mut archive =
        ZipArchive::new(file).with_context(|| format!("reading {}", path.display()))?;
    let comment = archive.comment().to_vec();
    let mut members = Vec::with_capacity(archive.len());
    for index in 0..archive.len() {
        let mut entry = archive.by_index(index)?;
        let is_dir = entry.is_dir();
        let mode = entry.unix_mode().unwrap_or(if is_dir { 0o755 } else { 0o644 }) & 0o7777;
        let mut data = Vec::new();
        if !is_dir {
            entry
                .read_to_end(&mut data)
                .with_context(|| format!("reading {} from {}", entry.name(), path.display()))?;
        }
        members.push(WheelMember {
            record: MemberRecord {
                path: PathBuf::from(entry.name()),
                data,
                mode,
                is_dir,
            },
            method: entry.compression(),
            modified: entry.last_modified(),
        });
    }
    Ok(WheelContents { members, comment })
}

fn write_wheel(file: &mut File, contents: &WheelContents) -> Result<()> {
    let mut zip = ZipWriter::new(file);
    for member in &contents.members {
        let name = member.name();
        let options = FileOptions::default()
            .last_modified_time(member.modified)
            .unix_permissions(member.record.mode);
        if member.record.is_dir {
            zip.add_directory(name.as_str(), options)
                .with_context(|| format!("writing directory {name}"))?;
            continue;
        }
        // Level 0 deflate keeps the bytes independent of the zlib in use.
        let options = match member.method {
            CompressionMethod::Stored => options.compression_method(CompressionMethod::Stored),
            _ => options
                .compression_method(CompressionMethod::Deflated)
                .compression_level(Some(0)),
        };
        zip.start_file(name.as_str(), options)
            .with_context(|| format!("writing {name}"))?;
        zip.write_all(&member.record.data)?;
    }
    if !contents.comment.is_empty() {
        zip.set_raw_comment(contents.comment.clone());
    }
    zip.finish()?;
    Ok(())
}

fn group(path: &str) -> u8 {
    if path.contains("/RECORD") {
        3
    } else if path.contains("dist-info") {
        2
    } else {
        1
    }
}

/// Breadth-first ordering key: a directory's files sort before its
/// subdirectories, and names within a level sort lexicographically.
#[must_use]
pub fn breadth_first_key(path: &str) -> Vec<(bool, &str)> {
    let mut parts: Vec<&str> = path.split('/').collect();
    let last = parts.pop().unwrap_or_default();
    let mut key: Vec<(bool, &str)> = parts.into_iter().map(|dir| (true, dir)).collect();
    key.push((false, last));
    key
}

fn compare_paths(a: &str, b: &str) -> Ordering {
    group(a)
        .cmp(&group(b))
        .then_with(|| breadth_first_key(a).cmp(&breadth_first_key(b)))
}

fn record_text(line: &[u8]) -> String {
    String::from_utf8_lossy(line)
        .trim_end_matches(['\r', '\n'])
        .to_string()
}

/// RECORD lines group by their path but order on the whole line.
fn compare_record_lines(a: &[u8], b: &[u8]) -> Ordering {
    let (a, b) = (record_text(a), record_text(b));
    let path = |line: &str| line.split(',').next().unwrap_or_default().to_string();
    group(&path(&a))
        .cmp(&group(&path(&b)))
        .then_with(|| breadth_first_key(&a).cmp(&breadth_first_key(&b)))
}

fn sort_record(data: &[u8]) -> Vec<u8> {
    let mut lines: Vec<&[u8]> = data.split_inclusive(|byte| *byte == b'\n').collect();
    lines.sort_by(|a, b| compare_record_lines(a, b));
    lines.concat()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const PATHS: [&str; 9] = [
        "a/__init__.py",
        "a/z.py",
        "a/x/x.py",
        "a/x/y/x.py",
        "a/y/x.py",
        "a-2023.01.13.dist-info/METADATA",
        "a-2023.01.13.dist-info/WHEEL",
        "a-2023.01.13.dist-info/top_level.txt",
        "a-2023.01.13.dist-info/RECORD",
    ];
    const SHUFFLE: [usize; 9] = [2, 3, 0, 1, 4, 7, 6, 5, 8];

    fn sorted(mut paths: Vec<&str>) -> Vec<&str> {
        paths.sort_by(|a, b| compare_paths(a, b));
        paths
    }

    fn record_lines(paths: &[&str]) -> Vec<u8> {
        paths
            .iter()
            .flat_map(|path| format!("{path},sha256=X,1234\n").into_bytes())
            .collect()
    }

    fn write_test_wheel(path: &Path, names: &[&str], mode: u32) -> Result<()> {
        let mut zip = ZipWriter::new(File::create(path)?);
        let options = FileOptions::default()
            .compression_method(CompressionMethod::Deflated)
            .unix_permissions(mode)
            .last_modified_time(DateTime::from_date_and_time(2021, 6, 1, 12, 30, 0).unwrap());
        for name in names {
            zip.start_file(*name, options)?;
            if name.ends_with("RECORD") {
                let shuffled: Vec<&str> = SHUFFLE.iter().map(|i| PATHS[*i]).collect();
                zip.write_all(&record_lines(&shuffled))?;
            } else {
                zip.write_all(format!("# {name}\n").repeat(50).as_bytes())?;
            }
        }
        zip.finish()?;
        Ok(())
    }

    fn names(path: &Path) -> Result<Vec<String>> {
        let mut archive = ZipArchive::new(File::open(path)?)?;
        (0..archive.len())
            .map(|i| Ok(archive.by_index(i)?.name().to_string()))
            .collect()
    }

    #[test]
    fn files_sort_before_directories() {
        assert_eq!(sorted(vec!["1/x.py", "2.py"]), ["2.py", "1/x.py"]);
    }

    #[test]
    fn breadth_first_handles_arbitrary_depth() {
        let expected = ["4.py", "1/2.py", "1/1/x.py", "2/x/x.py", "3/x.py"];
        let shuffled = vec![expected[3], expected[1], expected[4], expected[0], expected[2]];
        assert_eq!(sorted(shuffled), expected);
    }

    #[test]
    fn dist_info_and_record_sort_last() {
        let shuffled: Vec<&str> = SHUFFLE.iter().map(|i| PATHS[*i]).collect();
        assert_eq!(sorted(shuffled), PATHS);
        assert_eq!(sorted(PATHS.to_vec()), PATHS, "sorting is idempotent");
    }

    #[test]
    fn record_lines_are_sorted_by_path() {
        let shuffled: Vec<&str> = SHUFFLE.iter().map(|i| PATHS[*i]).collect();
        assert_eq!(sort_record(&record_lines(&shuffled)), record_lines(&PATHS));
    }

    #[test]
    fn record_lines_compare_beyond_the_path() {
        let data = b"demo/a,sha256=X,1\ndemo/a+b,sha256=Y,2\ndemo-0.1.0.dist-info/RECORD,,\n";
        assert_eq!(
            sort_record(data),
            b"demo/a+b,sha256=Y,2\ndemo/a,sha256=X,1\ndemo-0.1.0.dist-info/RECORD,,\n".to_vec()
        );
    }

    #[test]
    fn normalize_applies_epoch_and_modes() -> Result<()> {
        let temp = tempdir()?;
        let wheel = temp.path().join("a-2023.1.13-py3-none-any.whl");
        write_test_wheel(&wheel, &["a/__init__.py", "a/cli.py"], 0o777)?;
        let epoch = Epoch::new(1_704_067_200);

        let report = normalize_wheel(&wheel, epoch)?;

        assert_eq!(report.members, 2);
        let mut archive = ZipArchive::new(File::open(&wheel)?)?;
        for i in 0..archive.len() {
            let entry = archive.by_index(i)?;
            assert_eq!(entry.unix_mode().map(|m| m & 0o7777), Some(0o755));
            assert_eq!(entry.compression(), CompressionMethod::Deflated);
            assert!(entry.compressed_size() >= entry.size());
            let modified = entry.last_modified();
            assert_eq!(
                (modified.year(), modified.month(), modified.day()),
                (2024, 1, 1)
            );
        }
        Ok(())
    }

    #[test]
    fn normalize_strips_write_bits_from_plain_files() -> Result<()> {
        let temp = tempdir()?;
        let wheel = temp.path().join("a-2023.1.13-py3-none-any.whl");
        write_test_wheel(&wheel, &["a/__init__.py"], 0o666)?;

        normalize_wheel(&wheel, Epoch::earliest())?;

        let mut archive = ZipArchive::new(File::open(&wheel)?)?;
        let entry = archive.by_index(0)?;
        assert_eq!(entry.unix_mode().map(|m| m & 0o7777), Some(0o644));
        Ok(())
    }

    #[test]
    fn normalize_preserves_order_and_is_reproducible() -> Result<()> {
        let temp = tempdir()?;
        let shuffled: Vec<&str> = SHUFFLE.iter().map(|i| PATHS[*i]).collect();
        let first = temp.path().join("first.whl");
        let second = temp.path().join("second.whl");
        write_test_wheel(&first, &shuffled, 0o664)?;
        write_test_wheel(&second, &shuffled, 0o600)?;
        let epoch = Epoch::new(1_600_000_000);

        normalize_wheel(&first, epoch)?;
        normalize_wheel(&second, epoch)?;

        assert_eq!(names(&first)?, shuffled);
        assert_eq!(fs::read(&first)?, fs::read(&second)?);
        Ok(())
    }

    #[test]
    fn sort_reorders_members_and_record() -> Result<()> {
        let temp = tempdir()?;
        let shuffled: Vec<&str> = SHUFFLE.iter().map(|i| PATHS[*i]).collect();
        let wheel = temp.path().join("a-2023.1.13-py3-none-any.whl");
        write_test_wheel(&wheel, &shuffled, 0o644)?;
        let epoch = Epoch::new(1_600_000_000);
        normalize_wheel(&wheel, epoch)?;

        sort_wheel(&wheel)?;

        assert_eq!(names(&wheel)?, PATHS);
        let mut archive = ZipArchive::new(File::open(&wheel)?)?;
        let mut record = Vec::new();
        archive
            .by_name("a-2023.01.13.dist-info/RECORD")?
            .read_to_end(&mut record)?;
        assert_eq!(record, record_lines(&PATHS));
        let meta = fs::metadata(&wheel)?;
        assert_eq!(
            FileTime::from_last_modification_time(&meta).unix_seconds(),
            1_600_000_000
        );
        Ok(())
    }

    #[test]
    fn directories_stay_directories() -> Result<()> {
        let temp = tempdir()?;
        let wheel = temp.path().join("demo-0.1.0-py3-none-any.whl");
        let mut zip = ZipWriter::new(File::create(&wheel)?);
        zip.add_directory("demo/", FileOptions::default().unix_permissions(0o700))?;
        zip.start_file("demo/__init__.py", FileOptions::default())?;
        zip.write_all(b"VALUE = 1\n")?;
        zip.finish()?;

        normalize_wheel(&wheel, Epoch::earliest())?;

        let mut archive = ZipArchive::new(File::open(&wheel)?)?;
        let entry = archive.by_index(0)?;
        assert_eq!(entry.name(), "demo/");
        assert!(entry.is_dir());
        assert_eq!(entry.unix_mode().map(|m| m & 0o7777), Some(0o755));
        Ok(())
    }

    #[test]
    fn stored_members_stay_stored() -> Result<()> {
        let temp = tempdir()?;
        let wheel = temp.path().join("demo-0.1.0-py3-none-any.whl");
        let mut zip = ZipWriter::new(File::create(&wheel)?);
        let stored = FileOptions::default().compression_method(CompressionMethod::Stored);
        zip.start_file("demo/data.bin", stored)?;
        zip.write_all(&[7u8; 64])?;
        zip.start_file("demo/__init__.py", FileOptions::default())?;
        zip.write_all(b"VALUE = 1\n")?;
        zip.finish()?;

        normalize_wheel(&wheel, Epoch::earliest())?;

        let mut archive = ZipArchive::new(File::open(&wheel)?)?;
        assert_eq!(
            archive.by_name("demo/data.bin")?.compression(),
            CompressionMethod::Stored
        );
        assert_eq!(
            archive.by_name("demo/__init__.py")?.compression(),
            CompressionMethod::Deflated
        );
        Ok(())
    }

    #[test]
    fn archive_comment_is_kept_byte_for_byte() -> Result<()> {
        let temp = tempdir()?;
        let wheel = temp.path().join("demo-0.1.0-py3-none-any.whl");
        let comment = b"built by \xff\xfe tooling".to_vec();
        let mut zip = ZipWriter::new(File::create(&wheel)?);
        zip.start_file("demo/__init__.py", FileOptions::default())?;
        zip.write_all(b"")?;
        zip.set_raw_comment(comment.clone());
        zip.finish()?;

        normalize_wheel(&wheel, Epoch::earliest())?;
        sort_wheel(&wheel)?;

        let archive = ZipArchive::new(File::open(&wheel)?)?;
        assert_eq!(archive.comment(), comment.as_slice());
        Ok(())
    }
}
