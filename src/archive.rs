// src/archive.rs - CWS container handling (zip unpack/repack and member discovery)
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter};
use std::path::{Path, PathBuf};
use thiserror::Error;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

/// CWS slice images always carry 4-digit indices.
pub const SLICE_DIGITS: usize = 4;
pub const SLICE_EXTENSION: &str = ".png";

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Zip error: {0}")]
    Zip(#[from] zip::result::ZipError),
    #[error("Member escapes the extraction directory: {0}")]
    UnsafeMember(String),
}

/// Extract every member of `archive` into `dest`, returning member names in archive order.
pub fn unpack(archive: &Path, dest: &Path) -> Result<Vec<String>, ArchiveError> {
    let mut zip = ZipArchive::new(BufReader::new(File::open(archive)?))?;
    let mut names = Vec::with_capacity(zip.len());
    for index in 0..zip.len() {
        let mut member = zip.by_index(index)?;
        let relative = member
            .enclosed_name()
            .ok_or_else(|| ArchiveError::UnsafeMember(member.name().to_string()))?;
        let target = dest.join(relative);
        if member.is_dir() {
            fs::create_dir_all(&target)?;
            continue;
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut out = BufWriter::new(File::create(&target)?);
        io::copy(&mut member, &mut out)?;
        names.push(member.name().to_string());
    }
    tracing::debug!("Unpacked {} members from {} into {}", names.len(), archive.display(), dest.display());
    Ok(names)
}

/// Zip every file below `src` into a new archive at `archive`. Member names are
/// the `/`-separated paths relative to `src`.
pub fn pack(src: &Path, archive: &Path) -> Result<Vec<String>, ArchiveError> {
    let mut files = Vec::new();
    collect_files(src, src, &mut files)?;
    files.sort();

    let mut zip = ZipWriter::new(BufWriter::new(File::create(archive)?));
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
    let mut names = Vec::with_capacity(files.len());
    for (name, path) in files {
        zip.start_file(name.as_str(), options)?;
        let mut input = BufReader::new(File::open(&path)?);
        io::copy(&mut input, &mut zip)?;
        names.push(name);
    }
    zip.finish()?;
    tracing::debug!("Packed {} members into {}", names.len(), archive.display());
    Ok(names)
}

fn collect_files(root: &Path, dir: &Path, out: &mut Vec<(String, PathBuf)>) -> io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            collect_files(root, &path, out)?;
            continue;
        }
        let relative = path.strip_prefix(root).unwrap_or(&path);
        let name = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("/");
        out.push((name, path));
    }
    Ok(())
}

/// [`unpack`] on the blocking thread pool.
pub async fn unpack_blocking(archive: PathBuf, dest: PathBuf) -> Result<Vec<String>, ArchiveError> {
    tokio::task::spawn_blocking(move || unpack(&archive, &dest))
        .await
        .map_err(|e| ArchiveError::Io(io::Error::other(e)))?
}

/// [`pack`] on the blocking thread pool.
pub async fn pack_blocking(src: PathBuf, archive: PathBuf) -> Result<Vec<String>, ArchiveError> {
    tokio::task::spawn_blocking(move || pack(&src, &archive))
        .await
        .map_err(|e| ArchiveError::Io(io::Error::other(e)))?
}

/// Member names of an archive, without extracting anything.
pub fn member_names(archive: &Path) -> Result<Vec<String>, ArchiveError> {
    let zip = ZipArchive::new(BufReader::new(File::open(archive)?))?;
    Ok(zip.file_names().map(str::to_string).collect())
}

/// File name of slice `index` for a given base, e.g. `part0012.png`.
pub fn slice_name(base: &str, index: usize) -> String {
    format!("{}{:0width$}{}", base, index, SLICE_EXTENSION, width = SLICE_DIGITS)
}

/// Split `part0012.png` into (`part`, 12).
fn split_slice_name(name: &str) -> Option<(&str, usize)> {
    let stem = name.strip_suffix(SLICE_EXTENSION)?;
    if stem.len() < SLICE_DIGITS {
        return None;
    }
    let (base, digits) = stem.split_at(stem.len() - SLICE_DIGITS);
    if !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some((base, digits.parse().ok()?))
}

/// The slice images of an extracted archive: `<base>0000.png` up to the first gap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SliceSet {
    dir: PathBuf,
    base: String,
    count: usize,
}

impl SliceSet {
    /// Find the slice images in `dir`. `preferred_base` is used when slices with
    /// that base exist; otherwise the first base (in name order) that has a
    /// `0000` slice is taken. Returns `None` when there are no slices at all.
    pub fn discover(dir: &Path, preferred_base: Option<&str>) -> io::Result<Option<Self>> {
        let mut bases: BTreeMap<String, Vec<usize>> = BTreeMap::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some((base, index)) = split_slice_name(name) {
                bases.entry(base.to_string()).or_default().push(index);
            }
        }

        let chosen = preferred_base
            .filter(|b| bases.get(*b).is_some_and(|idx| idx.contains(&0)))
            .map(str::to_string)
            .or_else(|| {
                bases
                    .iter()
                    .find(|(_, idx)| idx.contains(&0))
                    .map(|(base, _)| base.clone())
            });

        let Some(base) = chosen else {
            return Ok(None);
        };
        let mut set = Self { dir: dir.to_path_buf(), base, count: 0 };
        while set.path_for(set.count).is_file() {
            set.count += 1;
        }
        Ok(Some(set))
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn path_for(&self, index: usize) -> PathBuf {
        self.dir.join(slice_name(&self.base, index))
    }
}

/// The auxiliary control files a CWS archive carries next to its slices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuxFile {
    Gcode,
    Slicing,
    Manifest,
}

impl AuxFile {
    pub const ALL: [AuxFile; 3] = [AuxFile::Gcode, AuxFile::Slicing, AuxFile::Manifest];

    pub fn label(self) -> &'static str {
        match self {
            AuxFile::Gcode => "gcode",
            AuxFile::Slicing => "slicing",
            AuxFile::Manifest => "manifest",
        }
    }

    fn matches(self, name: &str) -> bool {
        match self {
            AuxFile::Gcode => name.ends_with(".gcode"),
            AuxFile::Slicing => name.ends_with(".slicing"),
            AuxFile::Manifest => name == "manifest.xml",
        }
    }

    /// All files of this kind directly inside `dir`, in name order.
    pub fn find(self, dir: &Path) -> io::Result<Vec<PathBuf>> {
        let mut found = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            if entry.file_name().to_str().is_some_and(|n| self.matches(n)) {
                found.push(entry.path());
            }
        }
        found.sort();
        Ok(found)
    }
}
