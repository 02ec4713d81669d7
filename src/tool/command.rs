// src/tool/command.rs - Argument lists for the external raster tool
use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Size of the printer's projection canvas in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CanvasSize {
    pub width: u32,
    pub height: u32,
}

impl fmt::Display for CanvasSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

impl FromStr for CanvasSize {
    type Err = String;

    /// Parses `WxH`, tolerating surrounding whitespace and quotes.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim().trim_matches('"').trim();
        let (w, h) = trimmed
            .split_once('x')
            .ok_or_else(|| format!("expected WxH, got '{}'", trimmed))?;
        let width = w.trim().parse::<u32>().map_err(|e| format!("bad width '{}': {}", w, e))?;
        let height = h.trim().parse::<u32>().map_err(|e| format!("bad height '{}': {}", h, e))?;
        Ok(Self { width, height })
    }
}

/// Per-slice filters applied before the canvas fit.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FilterChain {
    pub negate: bool,
    /// Threshold in percent of full brightness.
    pub threshold_percent: Option<f64>,
    /// Correction image multiplied over the composited slice.
    pub mask: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    Convert,
    ProbeSize,
    Blank,
    Distortion,
    DiffImage,
}

/// One invocation of the raster tool. Never rendered through a shell.
#[derive(Debug, Clone)]
pub struct ToolCommand {
    kind: CommandKind,
    args: Vec<OsString>,
    inputs: Vec<PathBuf>,
    output: Option<PathBuf>,
}

impl ToolCommand {
    fn new(kind: CommandKind) -> Self {
        Self { kind, args: Vec::new(), inputs: Vec::new(), output: None }
    }

    fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    fn input(mut self, path: &Path) -> Self {
        self.args.push(path.as_os_str().to_os_string());
        self.inputs.push(path.to_path_buf());
        self
    }

    fn output(mut self, path: &Path) -> Self {
        self.args.push(path.as_os_str().to_os_string());
        self.output = Some(path.to_path_buf());
        self
    }

    /// Filter `input`, center it on a black canvas of `canvas` size, optionally
    /// multiply by a mask, and write the result to `output`.
    pub fn convert(input: &Path, filters: &FilterChain, canvas: CanvasSize, output: &Path) -> Self {
        let size = canvas.to_string();
        let mut cmd = Self::new(CommandKind::Convert).arg("(").input(input);
        if filters.negate {
            cmd = cmd.arg("-channel").arg("RGB").arg("-negate");
        }
        if let Some(percent) = filters.threshold_percent {
            cmd = cmd.arg("-threshold").arg(format!("{}%", percent));
        }
        cmd = cmd
            .arg("-background").arg("black")
            .arg("-compose").arg("Copy")
            .arg("-gravity").arg("center")
            .arg("-extent").arg(&size)
            .arg("-composite")
            .arg(")");
        if let Some(mask) = &filters.mask {
            cmd = cmd
                .arg("(")
                .input(mask)
                .arg("-resize").arg(format!("{}!", size))
                .arg(")")
                .arg("-compose").arg("Multiply")
                .arg("-gravity").arg("center")
                .arg("-composite");
        }
        cmd.output(output)
    }

    /// Ask for the pixel size of `image`. The response is `"WxH"`, quotes included.
    pub fn probe_size(image: &Path) -> Self {
        Self::new(CommandKind::ProbeSize)
            .input(image)
            .arg("-ping")
            .arg("-format")
            .arg("\"%wx%h\"")
            .arg("info:")
    }

    /// Uniform black image of the given size.
    pub fn blank(canvas: CanvasSize, output: &Path) -> Self {
        Self::new(CommandKind::Blank)
            .arg("-size")
            .arg(canvas.to_string())
            .arg("xc:black")
            .output(output)
    }

    /// Absolute-error distortion between two images, printed as a number.
    pub fn distortion(a: &Path, b: &Path) -> Self {
        Self::compare_pair(CommandKind::Distortion, a, b).arg("info:")
    }

    /// Same comparison, but writing the visual difference image to `output`.
    pub fn diff_image(a: &Path, b: &Path, output: &Path) -> Self {
        Self::compare_pair(CommandKind::DiffImage, a, b).output(output)
    }

    fn compare_pair(kind: CommandKind, a: &Path, b: &Path) -> Self {
        Self::new(kind)
            .input(a)
            .input(b)
            .arg("-metric")
            .arg("AE")
            .arg("-compare")
            .arg("-format")
            .arg("\"%[distortion]\"")
    }

    pub fn kind(&self) -> CommandKind {
        self.kind
    }

    pub fn args(&self) -> &[OsString] {
        &self.args
    }

    /// Image paths the command reads, in argument order.
    pub fn inputs(&self) -> &[PathBuf] {
        &self.inputs
    }

    /// Image path the command writes, if any.
    pub fn output_path(&self) -> Option<&Path> {
        self.output.as_deref()
    }
}

impl fmt::Display for ToolCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered: Vec<_> = self.args.iter().map(|a| a.to_string_lossy()).collect();
        write!(f, "{}", rendered.join(" "))
    }
}
