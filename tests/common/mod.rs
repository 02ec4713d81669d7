// Shared fixtures: a scripted stand-in for the raster tool and archive builders
#![allow(dead_code)]

use async_trait::async_trait;
use cws_stack::archive;
use cws_stack::tool::{CommandKind, ToolCommand, ToolError, ToolOutput, TransformTool};
use std::collections::BTreeMap;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::{Semaphore, mpsc};

/// Fake raster tool. Writes small text payloads instead of images so tests can
/// tell converted, blank and diff outputs apart.
///
/// - probe: reports `canvas`
/// - convert: `CONVERTED <flags>\n` + input bytes; exits 1 when the input starts with `BAD`
/// - blank: `BLANK WxH`; writes nothing and exits 1 when `fail_blank` is set
/// - distortion: `"0"` for byte-identical inputs, `"1234"` with exit 1 otherwise
pub struct FakeTool {
    pub canvas: String,
    pub panic_on_probe: bool,
    pub fail_blank: bool,
    gate: Option<Arc<Semaphore>>,
    started: Option<mpsc::UnboundedSender<PathBuf>>,
    log: Mutex<Vec<ToolCommand>>,
}

impl FakeTool {
    pub fn new() -> Self {
        Self {
            canvas: "\"64x48\"".to_string(),
            panic_on_probe: false,
            fail_blank: false,
            gate: None,
            started: None,
            log: Mutex::new(Vec::new()),
        }
    }

    pub fn with_canvas(mut self, canvas: &str) -> Self {
        self.canvas = canvas.to_string();
        self
    }

    pub fn panicking(mut self) -> Self {
        self.panic_on_probe = true;
        self
    }

    pub fn failing_blank(mut self) -> Self {
        self.fail_blank = true;
        self
    }

    /// Every convert announces its input on the returned channel, then waits
    /// for a permit on `gate`.
    pub fn gated(gate: Arc<Semaphore>) -> (Self, mpsc::UnboundedReceiver<PathBuf>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let tool = Self { gate: Some(gate), started: Some(tx), ..Self::new() };
        (tool, rx)
    }

    pub fn commands(&self, kind: CommandKind) -> Vec<ToolCommand> {
        self.log.lock().unwrap().iter().filter(|c| c.kind() == kind).cloned().collect()
    }
}

fn ok(stdout: &str) -> ToolOutput {
    ToolOutput { exit_code: Some(0), stdout: stdout.to_string(), stderr: String::new() }
}

fn failed(stdout: &str, stderr: &str) -> ToolOutput {
    ToolOutput { exit_code: Some(1), stdout: stdout.to_string(), stderr: stderr.to_string() }
}

fn arg_strings(command: &ToolCommand) -> Vec<String> {
    command.args().iter().map(|a| a.to_string_lossy().into_owned()).collect()
}

#[async_trait]
impl TransformTool for FakeTool {
    async fn execute(&self, command: &ToolCommand) -> Result<ToolOutput, ToolError> {
        self.log.lock().unwrap().push(command.clone());
        let args = arg_strings(command);
        match command.kind() {
            CommandKind::ProbeSize => {
                if self.panic_on_probe {
                    panic!("probe exploded");
                }
                Ok(ok(&self.canvas))
            }
            CommandKind::Blank => {
                if self.fail_blank {
                    return Ok(failed("", "convert: no encode delegate for this image format"));
                }
                let size = args.iter().skip_while(|a| *a != "-size").nth(1).cloned().unwrap_or_default();
                fs::write(command.output_path().unwrap(), format!("BLANK {}", size)).unwrap();
                Ok(ok(""))
            }
            CommandKind::Convert => {
                let input = command.inputs()[0].clone();
                if let Some(started) = &self.started {
                    let _ = started.send(input.clone());
                }
                if let Some(gate) = &self.gate {
                    gate.acquire().await.unwrap().forget();
                }
                let bytes = fs::read(&input).unwrap();
                if bytes.starts_with(b"BAD") {
                    return Ok(failed("", "convert: improper image header"));
                }
                let threshold = args
                    .iter()
                    .skip_while(|a| *a != "-threshold")
                    .nth(1)
                    .cloned()
                    .unwrap_or_else(|| "none".to_string());
                let flags = format!(
                    "negate={} threshold={} mask={}",
                    args.iter().any(|a| a == "-negate"),
                    threshold,
                    args.iter().any(|a| a == "Multiply"),
                );
                let mut payload = format!("CONVERTED {}\n", flags).into_bytes();
                payload.extend_from_slice(&bytes);
                fs::write(command.output_path().unwrap(), payload).unwrap();
                Ok(ok(""))
            }
            CommandKind::Distortion => {
                let inputs = command.inputs();
                if fs::read(&inputs[0]).unwrap() == fs::read(&inputs[1]).unwrap() {
                    Ok(ok("\"0\""))
                } else {
                    Ok(failed("\"1234\"", ""))
                }
            }
            CommandKind::DiffImage => {
                fs::write(command.output_path().unwrap(), b"DIFF").unwrap();
                Ok(failed("\"1234\"", ""))
            }
        }
    }
}

/// Build a template archive at `path` with `slices` slice images named after
/// `base`, plus one gcode, one slicing and one manifest file.
pub fn write_template(path: &Path, base: &str, slices: usize) {
    let dir = tempfile::tempdir().unwrap();
    for i in 0..slices {
        fs::write(dir.path().join(archive::slice_name(base, i)), format!("TEMPLATE {}", i)).unwrap();
    }
    fs::write(dir.path().join(format!("{}.gcode", base)), "G28\nG1 Z0.05\nM106 S255\n").unwrap();
    fs::write(dir.path().join(format!("{}.slicing", base)), "layer_height=0.05\n").unwrap();
    fs::write(dir.path().join("manifest.xml"), "<manifest><Slices/></manifest>\n").unwrap();
    archive::pack(dir.path(), path).unwrap();
}

/// Archive holding exactly the given members.
pub fn write_archive(path: &Path, members: &BTreeMap<String, Vec<u8>>) {
    let dir = tempfile::tempdir().unwrap();
    for (name, bytes) in members {
        fs::write(dir.path().join(name), bytes).unwrap();
    }
    archive::pack(dir.path(), path).unwrap();
}

/// `count` stack images `<prefix>0000.png`.. in `dir`; returns the first path.
pub fn write_stack(dir: &Path, prefix: &str, count: usize) -> PathBuf {
    for i in 0..count {
        fs::write(dir.join(format!("{}{:04}.png", prefix, i)), format!("SLICE {}", i)).unwrap();
    }
    dir.join(format!("{}0000.png", prefix))
}

/// Member name to contents, read straight from the zip.
pub fn read_archive(path: &Path) -> BTreeMap<String, Vec<u8>> {
    let mut zip = zip::ZipArchive::new(fs::File::open(path).unwrap()).unwrap();
    let mut members = BTreeMap::new();
    for i in 0..zip.len() {
        let mut member = zip.by_index(i).unwrap();
        let mut bytes = Vec::new();
        member.read_to_end(&mut bytes).unwrap();
        members.insert(member.name().to_string(), bytes);
    }
    members
}

pub fn text(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

pub fn is_empty_dir(dir: &Path) -> bool {
    fs::read_dir(dir).unwrap().next().is_none()
}
