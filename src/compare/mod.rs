// src/compare/mod.rs - Slice-by-slice and file-by-file equivalence of two CWS archives
pub mod text_diff;

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::archive::{self, ArchiveError, AuxFile, SliceSet};
use crate::config;
use crate::tool::{ToolCommand, TransformTool};

#[derive(Debug, Error)]
pub enum CompareError {
    #[error("Archive not found: {}", .0.display())]
    Missing(PathBuf),
    #[error("Error reading archive {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: ArchiveError,
    },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Default)]
pub struct CompareOptions {
    /// Where diff artifacts go; `<archive A without extension>_diff` when unset.
    pub diff_dir: Option<PathBuf>,
    /// Parent for the extraction directories; the system temp dir when unset.
    pub scratch_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AuxVerdict {
    Equal,
    Different,
    /// Present in only one of the archives.
    Missing,
}

#[derive(Debug, Clone, Serialize)]
pub struct ComparisonResult {
    pub equal: bool,
    pub slice_count_a: usize,
    pub slice_count_b: usize,
    pub slices_equal: usize,
    /// Indices whose distortion was not exactly zero.
    pub slices_different: Vec<usize>,
    pub gcode: AuxVerdict,
    pub slicing: AuxVerdict,
    /// Reported only; manifest differences do not affect `equal`.
    pub manifest: AuxVerdict,
    pub diff_dir: PathBuf,
    pub compared_at: DateTime<Utc>,
}

impl ComparisonResult {
    pub fn counts_match(&self) -> bool {
        self.slice_count_a == self.slice_count_b
    }

    pub fn diff_image_path(&self, index: usize) -> PathBuf {
        self.diff_dir.join(diff_image_name(index))
    }

    fn verdict_mut(&mut self, kind: AuxFile) -> &mut AuxVerdict {
        match kind {
            AuxFile::Gcode => &mut self.gcode,
            AuxFile::Slicing => &mut self.slicing,
            AuxFile::Manifest => &mut self.manifest,
        }
    }
}

fn diff_image_name(index: usize) -> String {
    format!("diff{:04}.png", index)
}

/// Default artifact directory for comparing `a`: its path with the extension
/// replaced by `_diff`.
pub fn default_diff_dir(a: &Path) -> PathBuf {
    let mut stem = a.with_extension("").into_os_string();
    stem.push("_diff");
    PathBuf::from(stem)
}

/// Files written into the diff directory by one comparison.
struct Artifacts {
    dir: PathBuf,
    created_dir: bool,
    written: Vec<PathBuf>,
}

impl Artifacts {
    fn prepare(dir: PathBuf) -> std::io::Result<Self> {
        let created_dir = !dir.exists();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir, created_dir, written: Vec::new() })
    }

    fn path(&mut self, name: &str) -> PathBuf {
        let path = self.dir.join(name);
        self.written.push(path.clone());
        path
    }

    /// Remove what this comparison produced, and the directory if it made it.
    /// A directory that was already there goes only when it is left empty.
    fn discard(self) {
        for path in &self.written {
            let _ = fs::remove_file(path);
        }
        if self.created_dir {
            if let Err(e) = fs::remove_dir_all(&self.dir) {
                tracing::warn!("Could not remove diff directory {}: {}", self.dir.display(), e);
            }
        } else if let Err(e) = fs::remove_dir(&self.dir) {
            tracing::debug!("Keeping diff directory {}: {}", self.dir.display(), e);
        }
    }
}

/// Compare two archives. Slices are measured with the tool's distortion metric,
/// auxiliary files line by line. Diff artifacts are left behind only when the
/// archives differ.
pub async fn compare(
    a: &Path,
    b: &Path,
    options: &CompareOptions,
    tool: &dyn TransformTool,
) -> Result<ComparisonResult, CompareError> {
    for path in [a, b] {
        if !path.is_file() {
            tracing::error!("Can't find {} for comparing", path.display());
            return Err(CompareError::Missing(path.to_path_buf()));
        }
    }
    tracing::info!("Comparing {} with {}", a.display(), b.display());

    let dir_a = scratch(options)?;
    let dir_b = scratch(options)?;
    extract(a, dir_a.path()).await?;
    extract(b, dir_b.path()).await?;

    let slices_a = SliceSet::discover(dir_a.path(), file_stem(a).as_deref())?;
    let slices_b = SliceSet::discover(dir_b.path(), file_stem(b).as_deref())?;
    let count_a = slices_a.as_ref().map_or(0, SliceSet::count);
    let count_b = slices_b.as_ref().map_or(0, SliceSet::count);

    let diff_dir = options.diff_dir.clone().unwrap_or_else(|| default_diff_dir(a));
    let mut artifacts = Artifacts::prepare(diff_dir.clone())?;
    let mut result = ComparisonResult {
        equal: false,
        slice_count_a: count_a,
        slice_count_b: count_b,
        slices_equal: 0,
        slices_different: Vec::new(),
        gcode: AuxVerdict::Missing,
        slicing: AuxVerdict::Missing,
        manifest: AuxVerdict::Missing,
        diff_dir,
        compared_at: Utc::now(),
    };
    if !result.counts_match() {
        tracing::warn!("Archives have a different number of slices: {} vs {}", count_a, count_b);
    }

    if let (Some(slices_a), Some(slices_b)) = (&slices_a, &slices_b) {
        for index in 0..count_a.min(count_b) {
            let (image_a, image_b) = (slices_a.path_for(index), slices_b.path_for(index));
            if slices_identical(tool, &image_a, &image_b).await {
                result.slices_equal += 1;
                continue;
            }
            let diff_path = artifacts.path(&diff_image_name(index));
            tracing::info!("Found differences: {}", diff_path.display());
            result.slices_different.push(index);
            let written = tool
                .execute(&ToolCommand::diff_image(&image_a, &image_b, &diff_path))
                .await;
            if let Err(e) = written {
                tracing::warn!("Could not write diff image {}: {}", diff_path.display(), e);
            }
        }
    }
    if !result.slices_different.is_empty() {
        tracing::info!("Found differences on {} slices", result.slices_different.len());
    }

    let (name_a, name_b) = (display_name(a), display_name(b));
    for kind in AuxFile::ALL {
        let verdict = compare_aux(kind, dir_a.path(), dir_b.path(), &name_a, &name_b, &mut artifacts)?;
        match (kind, verdict) {
            (_, AuxVerdict::Equal) => {}
            (AuxFile::Manifest, AuxVerdict::Different) => {
                tracing::info!("Manifest files don't match. This usually does not cause issues.")
            }
            (_, verdict) => tracing::info!("{} files: {:?}", kind.label(), verdict),
        }
        *result.verdict_mut(kind) = verdict;
    }

    result.equal = result.counts_match()
        && result.slices_different.is_empty()
        && result.gcode == AuxVerdict::Equal
        && result.slicing == AuxVerdict::Equal;

    if result.equal {
        artifacts.discard();
    }
    tracing::info!("Archives are {}", if result.equal { "equivalent" } else { "different" });
    Ok(result)
}

/// Exactly zero distortion is equal; a failed run or unparsable output is not.
async fn slices_identical(tool: &dyn TransformTool, a: &Path, b: &Path) -> bool {
    match tool.execute(&ToolCommand::distortion(a, b)).await {
        Ok(output) => {
            let distortion = output.distortion();
            tracing::debug!("Distortion for {}: {:?}", a.display(), distortion);
            distortion == Some(0.0)
        }
        Err(e) => {
            tracing::warn!("Distortion measurement failed for {}: {}", a.display(), e);
            false
        }
    }
}

fn compare_aux(
    kind: AuxFile,
    dir_a: &Path,
    dir_b: &Path,
    name_a: &str,
    name_b: &str,
    artifacts: &mut Artifacts,
) -> Result<AuxVerdict, CompareError> {
    let found_a = kind.find(dir_a)?;
    let found_b = kind.find(dir_b)?;
    if found_a.len() > 1 || found_b.len() > 1 {
        tracing::warn!("More than one {} file detected! Only the first one is checked.", kind.label());
    }
    let (file_a, file_b) = match (found_a.first(), found_b.first()) {
        (Some(a), Some(b)) => (a, b),
        (None, None) => return Ok(AuxVerdict::Equal),
        _ => {
            tracing::warn!("{} file present in only one archive", kind.label());
            return Ok(AuxVerdict::Missing);
        }
    };

    let text_a = String::from_utf8_lossy(&fs::read(file_a)?).into_owned();
    let text_b = String::from_utf8_lossy(&fs::read(file_b)?).into_owned();
    let lines_a = text_diff::split_lines(&text_a);
    let lines_b = text_diff::split_lines(&text_b);
    let Some(line) = text_diff::first_difference(&lines_a, &lines_b) else {
        return Ok(AuxVerdict::Equal);
    };

    tracing::info!("{} files first differ at line {}", kind.label(), line + 1);
    let member = file_a
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| kind.label().to_string());
    let report = artifacts.path(&format!("{}.diff.html", member));
    fs::write(&report, text_diff::render_html(&lines_a, &lines_b, name_a, name_b))?;
    Ok(AuxVerdict::Different)
}

fn scratch(options: &CompareOptions) -> Result<tempfile::TempDir, CompareError> {
    Ok(config::scratch_in(options.scratch_dir.as_deref(), "cws-compare-")?)
}

async fn extract(archive: &Path, dest: &Path) -> Result<(), CompareError> {
    archive::unpack_blocking(archive.to_path_buf(), dest.to_path_buf())
        .await
        .map(|_| ())
        .map_err(|source| CompareError::Read { path: archive.to_path_buf(), source })
}

fn file_stem(path: &Path) -> Option<String> {
    path.file_stem().map(|s| s.to_string_lossy().into_owned())
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}
