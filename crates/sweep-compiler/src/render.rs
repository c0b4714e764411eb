//! Boundary to whatever turns `{format, data}` into file text.

use serde_json::{json, Value};
use std::io::{ErrorKind, Write};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::thread;
use sweep_core::{Result, SweepError};

/// Files the simulation expects under `src/` of the run directory.
pub const SRC_SUBDIR_FILES: [&str; 2] = ["Makefile.local", "cparam.local"];

/// `run_in.yaml` -> `run.in`, `cparam_local.yaml` -> `cparam.local`.
pub fn output_filename(config_file: &str) -> String {
    let stem = match config_file.rsplit_once('.') {
        Some((stem, _ext)) => stem,
        None => config_file,
    };
    stem.replace('_', ".")
}

/// Path of the rendered file relative to the run directory.
pub fn output_relpath(config_file: &str) -> PathBuf {
    let name = output_filename(config_file);
    if SRC_SUBDIR_FILES.contains(&name.as_str()) {
        PathBuf::from("src").join(name)
    } else {
        PathBuf::from(name)
    }
}

pub trait ConfigRenderer {
    fn render(&self, format: &str, data: &Value, output_filename: &str) -> Result<String>;

    fn describe(&self) -> String;
}

/// Serializes `data` directly for the `yaml`/`yml` and `json` formats.
#[derive(Debug, Clone, Copy, Default)]
pub struct StructuredRenderer;

impl ConfigRenderer for StructuredRenderer {
    fn render(&self, format: &str, data: &Value, output_filename: &str) -> Result<String> {
        match format {
            "yaml" | "yml" => serde_yaml::to_string(data).map_err(|e| {
                SweepError::config(format!("could not render {} as yaml: {}", output_filename, e))
            }),
            "json" => {
                let mut text = serde_json::to_string_pretty(data)?;
                text.push('\n');
                Ok(text)
            }
            other => Err(SweepError::config(format!(
                "format '{}' of {} needs an external renderer (set render_command in the plan)",
                other, output_filename
            ))),
        }
    }

    fn describe(&self) -> String {
        "structured".to_string()
    }
}

/// Runs an external command per document: JSON `{format, data,
/// output_filename}` on stdin, rendered text on stdout.
#[derive(Debug, Clone)]
pub struct CommandRenderer {
    argv: Vec<String>,
}

impl CommandRenderer {
    pub fn new(argv: Vec<String>) -> Result<Self> {
        if argv.is_empty() {
            return Err(SweepError::config("render command cannot be empty"));
        }
        Ok(CommandRenderer { argv })
    }
}

impl ConfigRenderer for CommandRenderer {
    fn render(&self, format: &str, data: &Value, output_filename: &str) -> Result<String> {
        let request = json!({
            "format": format,
            "data": data,
            "output_filename": output_filename,
        });
        let payload = serde_json::to_vec(&request)?;
        let program = &self.argv[0];
        let mut child = Command::new(program)
            .args(&self.argv[1..])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                if e.kind() == ErrorKind::NotFound {
                    SweepError::config(format!("render command `{}` not found", program))
                } else {
                    SweepError::config(format!("could not start render command `{}`: {}", program, e))
                }
            })?;
        // stdin is fed from its own thread so stdout drains concurrently.
        let writer = child.stdin.take().map(|mut stdin| {
            thread::spawn(move || {
                let written = stdin.write_all(&payload);
                drop(stdin);
                written
            })
        });
        let output = child.wait_with_output().map_err(|e| {
            SweepError::config(format!("render command `{}` did not finish: {}", program, e))
        })?;
        let written = match writer.map(|handle| handle.join()) {
            None => Ok(()),
            Some(Ok(result)) => result,
            Some(Err(_)) => Err(std::io::Error::new(ErrorKind::Other, "stdin writer panicked")),
        };
        if !output.status.success() {
            return Err(SweepError::config(format!(
                "render command `{}` failed for {} ({}): {}",
                program,
                output_filename,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        if let Err(e) = written {
            return Err(SweepError::config(format!(
                "render command `{}` closed stdin: {}",
                program, e
            )));
        }
        String::from_utf8(output.stdout).map_err(|_| {
            SweepError::config(format!(
                "render command `{}` produced non-utf8 output for {}",
                program, output_filename
            ))
        })
    }

    fn describe(&self) -> String {
        self.argv.join(" ")
    }
}
