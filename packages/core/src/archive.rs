//! Tar archive construction
//!
//! All tar streams pack produces go through this module. Layer blobs must
//! be reproducible: identical inputs have to produce byte-identical
//! archives so that layer diff-ids are stable across machines and runs.
//! To that end every entry is written with a fixed epoch mtime, a caller
//! supplied numeric uid/gid, and directory contents are walked in sorted
//! order.

use anyhow::{Context, Result};
use flate2::Compression;
use flate2::write::GzEncoder;
use std::fs::File;
use std::io::{Read, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tar::{Builder, EntryType, Header};

/// Fixed modification time stamped on every entry.
const EPOCH: u64 = 0;

/// Build an uncompressed tar of `src_dir`, rooted at `tar_root`, with
/// every entry owned by `uid:gid`.
pub fn create_tar(src_dir: &Path, tar_root: &str, uid: u64, gid: u64) -> Result<Vec<u8>> {
    let mut builder = Builder::new(Vec::new());
    append_tree(&mut builder, src_dir, tar_root, uid, gid)?;
    let buf = builder.into_inner().context("finishing tar archive")?;
    Ok(buf)
}

/// Build a gzip-compressed tar of `src_dir` and write it to `dst`.
pub fn create_tgz_file(
    dst: &Path,
    src_dir: &Path,
    tar_root: &str,
    uid: u64,
    gid: u64,
) -> Result<()> {
    let file = File::create(dst)
        .with_context(|| format!("creating layer file {}", dst.display()))?;
    let encoder = GzEncoder::new(file, Compression::default());
    let mut builder = Builder::new(encoder);
    append_tree(&mut builder, src_dir, tar_root, uid, gid)?;
    let encoder = builder.into_inner().context("finishing tar archive")?;
    encoder.finish().context("finishing gzip stream")?;
    Ok(())
}

/// A one-entry tar holding `text` at `path`, for injecting a config file
/// into a container through the copy endpoint.
pub fn create_single_file_tar(path: &str, text: &str) -> Result<Vec<u8>> {
    let mut builder = Builder::new(Vec::new());
    add_text_to_tar(&mut builder, path, text.as_bytes())?;
    let buf = builder.into_inner().context("finishing tar archive")?;
    Ok(buf)
}

/// Append a text entry to an open tar writer.
pub fn add_text_to_tar<W: Write>(builder: &mut Builder<W>, path: &str, data: &[u8]) -> Result<()> {
    let mut header = Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_mtime(EPOCH);
    header.set_cksum();
    builder
        .append_data(&mut header, in_archive_path(path), data)
        .with_context(|| format!("appending {path} to tar"))?;
    Ok(())
}

/// Append a reader as a file entry to an open tar writer.
pub fn add_file_to_tar<W: Write, R: Read>(
    builder: &mut Builder<W>,
    path: &str,
    size: u64,
    reader: R,
) -> Result<()> {
    let mut header = Header::new_gnu();
    header.set_size(size);
    header.set_mode(0o644);
    header.set_mtime(EPOCH);
    header.set_cksum();
    builder
        .append_data(&mut header, in_archive_path(path), reader)
        .with_context(|| format!("appending {path} to tar"))?;
    Ok(())
}

/// Append a symlink entry to an open tar writer.
pub fn add_symlink_to_tar<W: Write>(
    builder: &mut Builder<W>,
    path: &str,
    target: &str,
    uid: u64,
    gid: u64,
) -> Result<()> {
    let mut header = Header::new_gnu();
    header.set_entry_type(EntryType::Symlink);
    header.set_size(0);
    header.set_mode(0o777);
    header.set_mtime(EPOCH);
    header.set_uid(uid);
    header.set_gid(gid);
    header
        .set_link_name(target)
        .with_context(|| format!("symlink target {target}"))?;
    header.set_cksum();
    builder
        .append_data(&mut header, in_archive_path(path), std::io::empty())
        .with_context(|| format!("appending symlink {path} to tar"))?;
    Ok(())
}

pub(crate) fn append_tree<W: Write>(
    builder: &mut Builder<W>,
    src_dir: &Path,
    tar_root: &str,
    uid: u64,
    gid: u64,
) -> Result<()> {
    let root = in_archive_path(tar_root);

    let mut dir_header = Header::new_gnu();
    dir_header.set_entry_type(EntryType::Directory);
    dir_header.set_size(0);
    dir_header.set_mode(0o755);
    dir_header.set_mtime(EPOCH);
    dir_header.set_uid(uid);
    dir_header.set_gid(gid);
    dir_header.set_cksum();
    builder
        .append_data(&mut dir_header, format!("{root}/"), std::io::empty())
        .with_context(|| format!("appending {root}/ to tar"))?;

    for relative in walk_sorted(src_dir)? {
        let full = src_dir.join(&relative);
        let entry_path = format!("{root}/{}", relative.display());
        let metadata = full
            .symlink_metadata()
            .with_context(|| format!("reading metadata of {}", full.display()))?;

        let mut header = Header::new_gnu();
        header.set_mode(metadata.permissions().mode() & 0o7777);
        header.set_mtime(EPOCH);
        header.set_uid(uid);
        header.set_gid(gid);

        if metadata.file_type().is_symlink() {
            let target = std::fs::read_link(&full)
                .with_context(|| format!("reading symlink {}", full.display()))?;
            header.set_entry_type(EntryType::Symlink);
            header.set_size(0);
            header
                .set_link_name(&target)
                .with_context(|| format!("symlink target {}", target.display()))?;
            header.set_cksum();
            builder
                .append_data(&mut header, &entry_path, std::io::empty())
                .with_context(|| format!("appending symlink {entry_path} to tar"))?;
        } else if metadata.is_dir() {
            header.set_entry_type(EntryType::Directory);
            header.set_size(0);
            header.set_cksum();
            builder
                .append_data(&mut header, format!("{entry_path}/"), std::io::empty())
                .with_context(|| format!("appending {entry_path}/ to tar"))?;
        } else {
            header.set_entry_type(EntryType::Regular);
            header.set_size(metadata.len());
            header.set_cksum();
            let file = File::open(&full)
                .with_context(|| format!("opening {}", full.display()))?;
            builder
                .append_data(&mut header, &entry_path, file)
                .with_context(|| format!("appending {entry_path} to tar"))?;
        }
    }
    Ok(())
}

/// All paths under `dir`, relative to it, in lexicographic order.
fn walk_sorted(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut entries = Vec::new();
    let mut pending = vec![PathBuf::new()];
    while let Some(relative) = pending.pop() {
        let current = dir.join(&relative);
        let mut children: Vec<_> = std::fs::read_dir(&current)
            .with_context(|| format!("walking {}", current.display()))?
            .collect::<std::io::Result<_>>()
            .with_context(|| format!("walking {}", current.display()))?;
        children.sort_by_key(|e| e.file_name());
        for child in children {
            let child_relative = relative.join(child.file_name());
            let file_type = child.file_type()?;
            if file_type.is_dir() {
                pending.push(child_relative.clone());
            }
            entries.push(child_relative);
        }
    }
    entries.sort();
    Ok(entries)
}

/// Tar entry names are relative; the daemon extracts them against the
/// copy destination, so a `/workspace/app` root becomes `workspace/app`.
fn in_archive_path(path: &str) -> String {
    path.trim_start_matches('/').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tar::Archive;

    fn fixture_dir() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("bin")).unwrap();
        std::fs::write(dir.path().join("bin/detect"), "#!/bin/sh\nexit 0\n").unwrap();
        std::fs::write(dir.path().join("buildpack.toml"), "[buildpack]\n").unwrap();
        dir
    }

    fn entry_names(tar_bytes: &[u8]) -> Vec<String> {
        let mut archive = Archive::new(tar_bytes);
        archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().display().to_string())
            .collect()
    }

    #[test]
    fn create_tar_is_deterministic() {
        let dir = fixture_dir();
        let first = create_tar(dir.path(), "/buildpacks/sample/0.0.1", 0, 0).unwrap();
        let second = create_tar(dir.path(), "/buildpacks/sample/0.0.1", 0, 0).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn create_tar_roots_entries_without_leading_slash() {
        let dir = fixture_dir();
        let tar = create_tar(dir.path(), "/workspace/app", 0, 0).unwrap();
        let names = entry_names(&tar);
        assert_eq!(
            names,
            vec![
                "workspace/app/",
                "workspace/app/bin/",
                "workspace/app/bin/detect",
                "workspace/app/buildpack.toml",
            ]
        );
    }

    #[test]
    fn create_tar_overrides_ownership_and_mtime() {
        let dir = fixture_dir();
        let tar = create_tar(dir.path(), "/buildpacks/x/1", 1000, 1000).unwrap();
        let mut archive = Archive::new(&tar[..]);
        for entry in archive.entries().unwrap() {
            let entry = entry.unwrap();
            assert_eq!(entry.header().uid().unwrap(), 1000);
            assert_eq!(entry.header().gid().unwrap(), 1000);
            assert_eq!(entry.header().mtime().unwrap(), EPOCH);
        }
    }

    #[test]
    fn create_tgz_file_writes_gzip() {
        let dir = fixture_dir();
        let out = tempfile::tempdir().unwrap();
        let dst = out.path().join("layer.tar.gz");
        create_tgz_file(&dst, dir.path(), "/buildpacks/x/1", 0, 0).unwrap();

        let bytes = std::fs::read(&dst).unwrap();
        assert_eq!(&bytes[..2], &[0x1f, 0x8b]);
    }

    #[test]
    fn single_file_tar_holds_exactly_the_text() {
        let tar = create_single_file_tar("/buildpacks/order.toml", "groups = []\n").unwrap();
        let mut archive = Archive::new(&tar[..]);
        let mut contents = BTreeMap::new();
        for entry in archive.entries().unwrap() {
            let mut entry = entry.unwrap();
            let path = entry.path().unwrap().display().to_string();
            let mut text = String::new();
            entry.read_to_string(&mut text).unwrap();
            contents.insert(path, text);
        }
        assert_eq!(contents.len(), 1);
        assert_eq!(contents["buildpacks/order.toml"], "groups = []\n");
    }

    #[test]
    fn symlinks_are_preserved() {
        let dir = fixture_dir();
        std::os::unix::fs::symlink("0.0.1", dir.path().join("latest")).unwrap();
        let tar = create_tar(dir.path(), "/buildpacks/x", 0, 0).unwrap();

        let mut archive = Archive::new(&tar[..]);
        let found = archive.entries().unwrap().any(|e| {
            let e = e.unwrap();
            e.header().entry_type() == EntryType::Symlink
                && e.path().unwrap().ends_with("latest")
        });
        assert!(found);
    }
}
